//! The message-in-progress: sender, recipients, and accumulated body.

/// Envelope and body for one message being received.
///
/// Created empty when the connection is accepted, filled in by MAIL, RCPT
/// and DATA, and cleared by RSET or once the finished message has been
/// handed to the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Sender address from MAIL FROM.
    pub from: Option<String>,
    /// Recipient addresses from RCPT TO, in arrival order, deduplicated.
    pub to: Vec<String>,
    /// Body text accumulated during data capture.
    pub data: String,
}

impl Envelope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_sender(&mut self, address: String) {
        self.from = Some(address);
    }

    pub fn has_recipient(&self, address: &str) -> bool {
        self.to.iter().any(|to| to == address)
    }

    /// Adds a recipient. Adding an address already present is a no-op.
    pub fn add_recipient(&mut self, address: String) {
        if !self.has_recipient(&address) {
            self.to.push(address);
        }
    }

    /// Appends one captured body line, removing one leading `.` if present
    /// (dot-unstuffing) and terminating the line.
    pub fn append_line(&mut self, line: &str) {
        self.data.push_str(line.strip_prefix('.').unwrap_or(line));
        self.data.push('\n');
    }

    /// DATA may only start once a sender and at least one recipient are set.
    pub fn is_ready(&self) -> bool {
        self.from.is_some() && !self.to.is_empty()
    }

    pub fn reset(&mut self) {
        self.from = None;
        self.to.clear();
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_envelope_is_empty_and_not_ready() {
        let envelope = Envelope::new();
        assert!(envelope.from.is_none());
        assert!(envelope.to.is_empty());
        assert!(envelope.data.is_empty());
        assert!(!envelope.is_ready());
    }

    #[test]
    fn duplicate_recipients_collapse() {
        let mut envelope = Envelope::new();
        envelope.add_recipient("b@example.com".to_string());
        envelope.add_recipient("b@example.com".to_string());
        envelope.add_recipient("c@example.com".to_string());
        assert_eq!(envelope.to, vec!["b@example.com", "c@example.com"]);
    }

    #[test]
    fn ready_requires_sender_and_recipient() {
        let mut envelope = Envelope::new();
        envelope.set_sender("a@example.com".to_string());
        assert!(!envelope.is_ready());
        envelope.add_recipient("b@example.com".to_string());
        assert!(envelope.is_ready());
    }

    #[test]
    fn append_line_unstuffs_one_leading_dot() {
        let mut envelope = Envelope::new();
        envelope.append_line("..hello");
        envelope.append_line("plain");
        assert_eq!(envelope.data, ".hello\nplain\n");
    }

    #[test]
    fn reset_clears_everything() {
        let mut envelope = Envelope::new();
        envelope.set_sender("a@example.com".to_string());
        envelope.add_recipient("b@example.com".to_string());
        envelope.append_line("body");
        envelope.reset();
        assert_eq!(envelope, Envelope::new());
    }
}
