//! The implementation of the protocol itself (no client orchestration)
//!
//! ## Examples
//!
//! Serialization and deserialization is handled through the core [`Message`] type. Most of the standard rust conversion methods should work
//! and error appropriately.
//!
//! ### Deserialization
//!
//! If you have a string that represents a katcp message, you can convert directly into the [`Message`] struct.
//!
//! ```
//! use std::str::FromStr;
//!
//! use katcp_client::protocol::Message;
//!
//! let msg_str = "?set-unknown-parameter[123] 6.1 true my-attribute";
//! // Both of these are equivalent
//! let msg_a: Message = msg_str.try_into().unwrap();
//! let msg_b = Message::from_str(msg_str).unwrap();
//! ```
//!
//! If you are working on a stream of messages, you can invoke the parser directly. The parser is written with the [nom](https://github.com/Geal/nom)
//! parser combinator library, so the top level [`message`] can be used with that directly.
//!
//! ### Serialization
//!
//! If you have a constructed [`Message`], you can call anything that uses `Display` to serialize. The
//! serialized line always ends in a linefeed. Arguments are stored in their unescaped form and are
//! escaped on the way out, so an argument may contain spaces, newlines, tabs, backslashes and NULs.
//!
//! ```
//! use katcp_client::protocol::{Message, MessageKind};
//!
//! let msg = Message::new(MessageKind::Inform, "foo-bar", None, vec![
//!     "param-1", "param 2 with spaces",
//! ])
//! .unwrap(); // Panic on a bad name
//! let msg_str = msg.to_string();
//! assert_eq!(msg_str, "#foo-bar param-1 param\\_2\\_with\\_spaces\n");
//! ```

use core::{fmt::Display, str::FromStr};

use nom::{
    branch::alt,
    character::complete::{alpha1, alphanumeric1, char, digit0, none_of, one_of},
    combinator::{all_consuming, eof, map, map_res, opt, recognize},
    error::Error,
    multi::{many0, many1, separated_list0},
    sequence::{delimited, pair, preceded, tuple},
    IResult,
};
use thiserror::Error as ThisError;

use crate::utils::{escape, unescape};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
/// The kind of katcp message. The docs call this the type, but we want to scoot
/// around the fact that `type` is a reserved keyword.
pub enum MessageKind {
    /// Request (?) messages will always be acknowledged by a reply
    Request,
    /// Reply (!) messages are sent in response to a `Request`
    Reply,
    /// Inform (#) messages can be sent asynchronously and do not invoke a reply
    Inform,
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// The core raw message type of katcp
pub struct Message {
    /// The message kind
    pub(crate) kind: MessageKind,
    /// The message name
    pub(crate) name: String,
    /// The optional, positive message id
    pub(crate) id: Option<u32>,
    /// The (potentially empty) vector of message arguments.
    /// Arguments are held unescaped, escaping is applied when the
    /// message is serialized and removed when a line is parsed.
    pub(crate) arguments: Vec<String>,
}

#[derive(Debug, PartialEq, ThisError)]
/// The core error type of the codec
pub enum KatcpError {
    /// The line did not match the katcp message grammar
    #[error("message syntax error: {0}")]
    ParseError(nom::Err<Error<String>>),
    /// An argument existed but could not be converted to the requested type
    #[error("bad message argument: {0}")]
    BadArgument(String),
    /// The message ended before a required argument
    #[error("missing message argument")]
    MissingArgument,
    /// The message was not of the expected kind or name
    #[error("incorrect message type")]
    IncorrectType,
    /// Message ids on the wire are decimal numbers starting at one
    #[error("message ids start at one")]
    InvalidId,
}

pub type MessageResult = Result<Message, KatcpError>;

impl Message {
    /// A constructor for message that will create owned copies of the string-slice arguments
    /// # Safety
    /// This constructor does *not* validate the `name` or `id` and as such the
    /// serialized result may not be parseable. It is up to the caller to verify
    /// that the name matches the grammar and the id is positive.
    pub unsafe fn new_unchecked<T: AsRef<str>, U: AsRef<str>>(
        kind: MessageKind,
        name: T,
        id: Option<u32>,
        arguments: Vec<U>,
    ) -> Self {
        Self {
            kind,
            name: name.as_ref().into(),
            id,
            arguments: arguments.iter().map(|s| s.as_ref().into()).collect(),
        }
    }

    /// A constructor for message that will create owned copies of the string-slice arguments
    pub fn new<T: AsRef<str>, U: AsRef<str>>(
        kind: MessageKind,
        name: T,
        id: Option<u32>,
        arguments: Vec<U>,
    ) -> Result<Self, KatcpError> {
        if let Err(e) = all_consuming(name_parser)(name.as_ref()) {
            return Err(KatcpError::ParseError(own_nom_err(e)));
        }
        if id == Some(0) {
            return Err(KatcpError::InvalidId);
        }
        // Safety: name and id have been validated above, arguments are
        // escaped at serialization time and need no validation
        unsafe { Ok(Self::new_unchecked(kind, name, id, arguments)) }
    }

    /// Constructs a request message with no id
    pub fn request<T: AsRef<str>, U: AsRef<str>>(
        name: T,
        arguments: Vec<U>,
    ) -> Result<Self, KatcpError> {
        Self::new(MessageKind::Request, name, None, arguments)
    }

    /// Constructs a reply message with no id
    pub fn reply<T: AsRef<str>, U: AsRef<str>>(
        name: T,
        arguments: Vec<U>,
    ) -> Result<Self, KatcpError> {
        Self::new(MessageKind::Reply, name, None, arguments)
    }

    /// Constructs an inform message with no id
    pub fn inform<T: AsRef<str>, U: AsRef<str>>(
        name: T,
        arguments: Vec<U>,
    ) -> Result<Self, KatcpError> {
        Self::new(MessageKind::Inform, name, None, arguments)
    }

    /// Kind getter
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Name getter
    pub fn name(&self) -> String {
        self.name.clone()
    }

    /// Id getter
    pub fn id(&self) -> Option<u32> {
        self.id
    }

    /// Arguments getter
    pub fn arguments(&self) -> Vec<String> {
        self.arguments.clone()
    }
}

fn own_nom_err(e: nom::Err<Error<&str>>) -> nom::Err<Error<String>> {
    match e {
        nom::Err::Incomplete(i) => nom::Err::Incomplete(i),
        nom::Err::Error(Error { input, code }) => nom::Err::Error(Error {
            input: input.to_owned(),
            code,
        }),
        nom::Err::Failure(Error { input, code }) => nom::Err::Failure(Error {
            input: input.to_owned(),
            code,
        }),
    }
}

fn kind(input: &str) -> IResult<&str, MessageKind> {
    let (remaining, typ) = one_of("!#?")(input)?;
    Ok((remaining, match typ {
        '?' => MessageKind::Request,
        '!' => MessageKind::Reply,
        '#' => MessageKind::Inform,
        _ => unreachable!(),
    }))
}

fn name_parser(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alpha1,
        many0(alt((alphanumeric1, recognize(char('-'))))),
    ))(input)
}

fn id(input: &str) -> IResult<&str, u32> {
    map_res(
        delimited(
            char('['),
            recognize(tuple((one_of("123456789"), digit0))),
            char(']'),
        ),
        str::parse,
    )(input)
}

fn escape_seq(input: &str) -> IResult<&str, &str> {
    recognize(pair(char('\\'), one_of(r"\_0nret")))(input)
}

fn plain(input: &str) -> IResult<&str, &str> {
    // Unescaped space, tab, escape, newline, carriage return, backslash
    // and null may not appear inside an argument
    recognize(many1(none_of(" \t\u{001B}\n\r\\\0")))(input)
}

fn eol(input: &str) -> IResult<&str, &str> {
    recognize(one_of("\n\r"))(input)
}

/// A single argument token, decoded. The token may be empty: consecutive
/// separators and a trailing separator carry empty arguments.
fn argument(input: &str) -> IResult<&str, String> {
    map(recognize(many0(alt((escape_seq, plain)))), unescape)(input)
}

fn arguments(input: &str) -> IResult<&str, Vec<String>> {
    map(
        opt(preceded(char(' '), separated_list0(char(' '), argument))),
        Option::unwrap_or_default,
    )(input)
}

/// The parser combinator for messages. One could write a grammar that utilizes this parser with nom.
pub fn message(input: &str) -> IResult<&str, Message> {
    let (remaining, (kind, name, id, arguments, _)) =
        tuple((kind, name_parser, opt(id), arguments, alt((eol, eof))))(input)?;
    Ok((remaining, Message {
        kind,
        name: name.to_owned(),
        id,
        arguments,
    }))
}

impl FromStr for Message {
    type Err = KatcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match message(s) {
            Ok((_, m)) => Ok(m),
            Err(e) => Err(KatcpError::ParseError(own_nom_err(e))),
        }
    }
}

impl TryFrom<&str> for Message {
    type Error = KatcpError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::from_str(s)
    }
}

// Serialization
impl Display for Message {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let type_char = match self.kind {
            MessageKind::Request => '?',
            MessageKind::Reply => '!',
            MessageKind::Inform => '#',
        };
        write!(f, "{}{}", type_char, self.name)?;
        if let Some(id) = self.id {
            write!(f, "[{}]", id)?;
        }
        for argument in &self.arguments {
            write!(f, " {}", escape(argument))?;
        }
        writeln!(f)
    }
}

#[cfg(test)]
mod parser_tests {
    use super::*;

    #[test]
    fn test_msg_type() {
        assert_eq!(Ok(("", MessageKind::Reply)), kind("!"));
        assert_eq!(Ok(("", MessageKind::Inform)), kind("#"));
        assert_eq!(Ok(("", MessageKind::Request)), kind("?"));
        assert!(kind("^").is_err());
    }

    #[test]
    fn test_name() {
        assert_eq!(Ok(("", "set-rate")), name_parser("set-rate"));
        assert_eq!(Ok(("", "foobar")), name_parser("foobar"));
        assert_eq!(Ok(("", "f00-bar")), name_parser("f00-bar"));
        assert_eq!(Ok(("", "a")), name_parser("a"));
    }

    #[test]
    fn test_name_grammar() {
        assert!(Message::from_str("?1bad").is_err());
        assert!(Message::from_str("?-bad").is_err());
        assert!(Message::from_str("?bad.name").is_err());
        assert!(Message::from_str("?a").is_ok());
        assert!(Message::from_str("?a-b-c").is_ok());
        assert!(Message::from_str("?abc123").is_ok());
    }

    #[test]
    fn test_msg_id() {
        assert_eq!(Ok(("", 123)), id("[123]"));
        assert_eq!(Ok(("", 100)), id("[100]"));
        assert_eq!(Ok(("", 9)), id("[9]"));
        assert!(id("[0]").is_err());
    }

    #[test]
    fn test_escaped() {
        assert_eq!(Ok(("", r"\\")), escape_seq(r"\\"));
        assert_eq!(Ok(("", r"\_")), escape_seq(r"\_"));
        assert_eq!(Ok(("", r"\0")), escape_seq(r"\0"));
        assert_eq!(Ok(("", r"\n")), escape_seq(r"\n"));
        assert_eq!(Ok(("", r"\r")), escape_seq(r"\r"));
        assert_eq!(Ok(("", r"\e")), escape_seq(r"\e"));
        assert_eq!(Ok(("", r"\t")), escape_seq(r"\t"));
        assert!(escape_seq(r"\@").is_err());
        assert!(escape_seq(r"\x").is_err());
    }

    #[test]
    fn test_eol() {
        assert_eq!(Ok(("", "\n")), eol("\n"));
        assert_eq!(Ok(("", "\r")), eol("\r"));
    }

    #[test]
    fn test_plain() {
        assert_eq!(Ok(("", "6.1")), plain("6.1"));
        assert_eq!(Ok(("", "invalid")), plain("invalid"));
        assert_eq!(Ok(("\\_request.", "Unknown")), plain("Unknown\\_request."));
    }

    #[test]
    fn test_argument() {
        assert_eq!(Ok(("", "6.1".to_owned())), argument("6.1"));
        assert_eq!(
            Ok(("", "Unknown request.".to_owned())),
            argument(r"Unknown\_request.")
        );
    }

    #[test]
    fn test_escape_coverage() {
        // One argument carrying every escapable character in order
        let msg = Message::from_str(r"?foo \\\_\0\n\r\e\t").unwrap();
        assert_eq!(msg.arguments, vec!["\\ \0\n\r\u{001B}\t".to_owned()]);
    }

    #[test]
    fn test_argument_boundaries() {
        let msg = Message::from_str("!foo ").unwrap();
        assert_eq!(msg.arguments, vec!["".to_owned()]);

        let msg = Message::from_str("!foo  ").unwrap();
        assert_eq!(msg.arguments, vec!["".to_owned(), "".to_owned()]);

        let msg = Message::from_str(r"!foo \_ \_ ").unwrap();
        assert_eq!(msg.arguments, vec![
            " ".to_owned(),
            " ".to_owned(),
            "".to_owned()
        ]);
    }

    #[test]
    fn test_lexer_errors() {
        assert!(Message::from_str("").is_err());
        assert!(Message::from_str("^foo").is_err());
        assert!(Message::from_str("!foo tab\targ").is_err());
        assert!(Message::from_str(r"!foo bad\@escape").is_err());
        assert!(Message::from_str(r"!foo trailing\").is_err());
    }

    #[test]
    fn test_message() {
        assert_eq!(
            Message::request("set-rate", vec!["5.1"]).unwrap(),
            message("?set-rate 5.1").unwrap().1
        );
        assert_eq!(
            Message::request("set-rate", vec!["5.1"]).unwrap(),
            message("?set-rate 5.1\n").unwrap().1
        );
        assert_eq!(
            Message::reply("set-rate", vec!["ok"]).unwrap(),
            message("!set-rate ok").unwrap().1
        );
        assert_eq!(
            Message::reply("set-unknown-parameter", vec!["invalid", "Unknown request."]).unwrap(),
            message(r"!set-unknown-parameter invalid Unknown\_request.")
                .unwrap()
                .1
        );
        assert_eq!(
            Message::reply("set-rate", vec!["fail", "Hardware did not respond."]).unwrap(),
            message(r"!set-rate fail Hardware\_did\_not\_respond.")
                .unwrap()
                .1
        );
        assert_eq!(
            Message::new(MessageKind::Request, "set-rate", Some(123), vec!["4.1"]).unwrap(),
            message("?set-rate[123] 4.1").unwrap().1
        );
        assert_eq!(
            Message::new(MessageKind::Reply, "set-rate", Some(123), vec!["ok"]).unwrap(),
            message("!set-rate[123] ok").unwrap().1
        );
        assert_eq!(
            Message::request("sensor-list", Vec::<String>::new()).unwrap(),
            message("?sensor-list").unwrap().1
        );
        assert_eq!(
            Message::new(
                MessageKind::Request,
                "sensor-list",
                Some(420),
                Vec::<String>::new()
            )
            .unwrap(),
            message("?sensor-list[420]").unwrap().1
        );
        assert_eq!(
            Message::inform("sensor-list", vec![
                "drive.dc-voltage-elev",
                "Drive bus voltage",
                "V",
                "float",
                "0.0",
                "900.0"
            ])
            .unwrap(),
            message(r"#sensor-list drive.dc-voltage-elev Drive\_bus\_voltage V float 0.0 900.0")
                .unwrap()
                .1
        );
        assert_eq!(
            Message::inform("internet-box", vec![
                "address",
                "[2001:0db8:85a3:0000:0000:8a2e:0370:7334]:4000"
            ])
            .unwrap(),
            message(r"#internet-box address [2001:0db8:85a3:0000:0000:8a2e:0370:7334]:4000")
                .unwrap()
                .1
        );
    }

    #[test]
    fn test_constructor_validation() {
        assert!(Message::new(MessageKind::Request, "watchdog", Some(0), Vec::<String>::new())
            .is_err());
        assert!(Message::request("not a name", Vec::<String>::new()).is_err());
        assert!(Message::request("", Vec::<String>::new()).is_err());
    }
}



#[cfg(test)]
mod there_and_back_tests {
    use super::*;

    #[test]
    fn struct_and_back() {
        let msg = Message::new(MessageKind::Inform, "foo-bar", Some(123), vec![
            "foo", "bar baz", "", "\ttabbed\n",
        ])
        .unwrap();
        assert_eq!(Message::from_str(&msg.to_string()).unwrap(), msg);
    }

    #[test]
    fn string_and_back() {
        let msg_str = "#foo-bar[123] foo bar\n";
        assert_eq!(Message::from_str(msg_str).unwrap().to_string(), msg_str);
    }
}
