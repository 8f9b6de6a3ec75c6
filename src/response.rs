//! SMTP reply lines and per-command reply batching.

/// One reply line: a three-digit status code, a continuation flag, and the
/// human-readable text.
///
/// In a multi-line reply every line but the last carries the continuation
/// flag, which puts a `-` between code and text instead of a space.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: u16,
    pub partial: bool,
    pub message: String,
}

impl Response {
    /// Final (or only) line of a reply.
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            partial: false,
            message: message.into(),
        }
    }

    /// Continuation line of a multi-line reply.
    pub fn partial(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            partial: true,
            message: message.into(),
        }
    }

    /// Wire form, without the line terminator.
    pub fn format(&self) -> String {
        let separator = if self.partial { '-' } else { ' ' };
        format!("{}{}{}", self.code, separator, self.message)
    }
}

/// Ordered buffer of replies queued while one command is dispatched.
///
/// Handlers queue zero or more responses; the connection flushes the whole
/// batch to the wire once dispatch returns (and explicitly before a
/// transport upgrade, which must not race with pending output).
#[derive(Debug, Default)]
pub struct Responder {
    queued: Vec<Response>,
}

impl Responder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&mut self, response: Response) {
        self.queued.push(response);
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Takes the queued batch, leaving the buffer empty.
    pub fn take(&mut self) -> Vec<Response> {
        std::mem::take(&mut self.queued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_line_uses_space_separator() {
        let response = Response::new(250, "OK");
        assert_eq!(response.format(), "250 OK");
    }

    #[test]
    fn partial_line_uses_dash_separator() {
        let response = Response::partial(250, "PIPELINING");
        assert_eq!(response.format(), "250-PIPELINING");
    }

    #[test]
    fn responder_preserves_order_and_drains() {
        let mut responder = Responder::new();
        responder.respond(Response::partial(250, "first"));
        responder.respond(Response::new(250, "second"));

        let batch = responder.take();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].format(), "250-first");
        assert_eq!(batch[1].format(), "250 second");
        assert!(responder.is_empty());
    }
}
