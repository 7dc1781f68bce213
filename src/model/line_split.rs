/// Reassembles complete lines from arbitrarily split chunks of text.
///
/// A trailing fragment without a newline is held back until a later chunk
/// completes it. `\r\n` endings are normalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineAssembler {
    partial: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the lines it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.find('\n') {
            let mut line = std::mem::take(&mut self.partial);
            line.push_str(&rest[..pos]);
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
            rest = &rest[pos + 1..];
        }
        self.partial.push_str(rest);
        lines
    }

    /// Bytes held back waiting for a newline
    pub fn pending(&self) -> &str {
        &self.partial
    }

    pub fn clear(&mut self) {
        self.partial.clear();
    }
}
