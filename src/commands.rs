//! Command-line parsing: verb recognition and address syntax.

/// A recognized SMTP command with its argument text.
///
/// Verbs are matched case-insensitively; anything else falls into
/// `Unknown` so dispatch stays a closed match instead of a table lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<'a> {
    Auth(&'a str),
    Data,
    Ehlo,
    Helo,
    Help,
    Mail(&'a str),
    Noop,
    Quit,
    Rcpt(&'a str),
    Rset,
    StartTls,
    Vrfy,
    Unknown,
}

impl<'a> Command<'a> {
    pub fn parse(input: &'a str) -> Self {
        let (verb, arguments) = match input.split_once(' ') {
            Some((verb, rest)) => (verb, rest),
            None => (input, ""),
        };

        match verb.to_uppercase().as_str() {
            "AUTH" => Command::Auth(arguments),
            "DATA" => Command::Data,
            "EHLO" => Command::Ehlo,
            "HELO" => Command::Helo,
            "HELP" => Command::Help,
            "MAIL" => Command::Mail(arguments),
            "NOOP" => Command::Noop,
            "QUIT" => Command::Quit,
            "RCPT" => Command::Rcpt(arguments),
            "RSET" => Command::Rset,
            "STARTTLS" => Command::StartTls,
            "VRFY" => Command::Vrfy,
            _ => Command::Unknown,
        }
    }
}

/// Extracts the address from a `<...>`-delimited MAIL/RCPT argument.
///
/// The argument must begin with `<` and end with `>`; the address is the
/// text up to the first `>`, surrounding whitespace trimmed. Empty
/// addresses are rejected.
pub fn parse_address(arguments: &str) -> Option<&str> {
    let arguments = arguments.strip_prefix('<')?;
    if !arguments.ends_with('>') {
        return None;
    }

    let address = arguments.split('>').next().unwrap_or("").trim();
    if address.is_empty() {
        return None;
    }

    Some(address)
}
