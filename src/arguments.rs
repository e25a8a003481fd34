//! Conversions between katcp message arguments and typed values
//!
//! Message arguments are plain strings once the codec has removed the wire
//! escapes, these traits define how the fundamental katcp types map onto
//! them.

use chrono::{DateTime, TimeZone, Utc};

use crate::protocol::{KatcpError, Message, MessageKind};

/// The trait that is implemented for all the fundamental katcp types
pub trait ToKatcpArgument {
    /// Create a katcp message argument (String) from a self
    fn to_argument(&self) -> String;
}

pub trait FromKatcpArgument
where
    Self: Sized,
{
    type Err; // Not Error as to not clash with Self being an enum with an `Error` variant
    /// Create a self from a katcp message argument (String), potentially erroring
    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err>;
}

pub trait KatcpArgument: ToKatcpArgument + FromKatcpArgument {}

// Default KatcpArgument - "Trait Marker"
impl<T> KatcpArgument for T where T: ToKatcpArgument + FromKatcpArgument {}

// ---- Implementations for the "core" KatcpTypes

// str
impl ToKatcpArgument for str {
    fn to_argument(&self) -> String {
        self.to_owned()
    }
}

impl ToKatcpArgument for String {
    fn to_argument(&self) -> String {
        self.clone()
    }
}

impl FromKatcpArgument for String {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        Ok(s.as_ref().to_owned())
    }
}

macro_rules! number_argument {
    ($($t:ty),*) => {
        $(
            impl ToKatcpArgument for $t {
                fn to_argument(&self) -> String {
                    self.to_string()
                }
            }

            impl FromKatcpArgument for $t {
                type Err = KatcpError;

                fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
                    s.as_ref()
                        .parse()
                        .map_err(|_| KatcpError::BadArgument(s.as_ref().to_owned()))
                }
            }
        )*
    };
}

number_argument!(u32, u64, i32, i64, f32, f64);

// bool, `1` and `0` on the wire
impl ToKatcpArgument for bool {
    fn to_argument(&self) -> String {
        if *self { "1" } else { "0" }.to_owned()
    }
}

impl FromKatcpArgument for bool {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        match s.as_ref() {
            "1" => Ok(true),
            "0" => Ok(false),
            other => Err(KatcpError::BadArgument(other.to_owned())),
        }
    }
}

// DateTime<Utc>, fractional seconds since the unix epoch
impl ToKatcpArgument for DateTime<Utc> {
    fn to_argument(&self) -> String {
        let secs = self.timestamp() as f64;
        let nano = self.timestamp_subsec_nanos();
        let frac = nano as f64 / 1e9;
        format!("{}", secs + frac)
    }
}

impl FromKatcpArgument for DateTime<Utc> {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        let fractional: f64 = s
            .as_ref()
            .parse()
            .map_err(|_| KatcpError::BadArgument(s.as_ref().to_owned()))?;
        let secs = fractional as i64;
        let nanos = (fractional.fract() * 1e9) as u32;
        Utc.timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| KatcpError::BadArgument(s.as_ref().to_owned()))
    }
}

// Option, an absent value is an empty argument
impl<T> ToKatcpArgument for Option<T>
where
    T: ToKatcpArgument,
{
    fn to_argument(&self) -> String {
        match self {
            Some(v) => v.to_argument(),
            None => String::new(),
        }
    }
}

impl<E, T> FromKatcpArgument for Option<T>
where
    T: FromKatcpArgument<Err = E>,
{
    type Err = E;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        match s.as_ref() {
            "" => Ok(None),
            _ => Ok(Some(T::from_argument(s)?)),
        }
    }
}

// Return Code
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
/// Return codes that form the first argument of a reply
pub enum RetCode {
    /// Request successfully processed. Further arguments are request-specific
    Ok,
    /// Request malformed. Second argument is a human-readable description of the error
    Invalid,
    /// Valid request that could not be processed. Second argument is a human-readable description of the error.
    Fail,
}

impl ToKatcpArgument for RetCode {
    fn to_argument(&self) -> String {
        match self {
            RetCode::Ok => "ok",
            RetCode::Invalid => "invalid",
            RetCode::Fail => "fail",
        }
        .to_owned()
    }
}

impl FromKatcpArgument for RetCode {
    type Err = KatcpError;

    fn from_argument(s: impl AsRef<str>) -> Result<Self, Self::Err> {
        match s.as_ref() {
            "ok" => Ok(RetCode::Ok),
            "invalid" => Ok(RetCode::Invalid),
            "fail" => Ok(RetCode::Fail),
            other => Err(KatcpError::BadArgument(other.to_owned())),
        }
    }
}

impl Message {
    /// The status code of a reply message.
    ///
    /// Errors with [`KatcpError::IncorrectType`] when called on a request or
    /// inform, [`KatcpError::MissingArgument`] when the reply carries no
    /// arguments and [`KatcpError::BadArgument`] for a status outside of
    /// `ok`, `invalid` and `fail`.
    pub fn ret_code(&self) -> Result<RetCode, KatcpError> {
        if self.kind != MessageKind::Reply {
            return Err(KatcpError::IncorrectType);
        }
        let status = self.arguments.first().ok_or(KatcpError::MissingArgument)?;
        RetCode::from_argument(status)
    }
}

#[cfg(test)]
mod test_arguments {
    use super::*;

    #[test]
    fn test_string() {
        let s = "This is a message with spaces\n";
        assert_eq!(s, String::from_argument(s.to_argument()).unwrap());
    }

    #[test]
    fn test_numbers() {
        assert_eq!("42", 42u32.to_argument());
        assert_eq!(42u32, u32::from_argument("42").unwrap());
        assert_eq!(-3i64, i64::from_argument("-3").unwrap());
        assert_eq!(0.5f64, f64::from_argument("0.5").unwrap());
        assert!(u32::from_argument("nope").is_err());
    }

    #[test]
    fn test_bool() {
        assert_eq!("1", true.to_argument());
        assert!(!bool::from_argument("0").unwrap());
        assert!(bool::from_argument("true").is_err());
    }

    #[test]
    fn test_timestamp() {
        let ts = Utc.timestamp_opt(42069, 42069000).unwrap();
        assert_eq!(
            ts,
            DateTime::<Utc>::from_argument(ts.to_argument()).unwrap()
        );
    }

    #[test]
    fn test_option() {
        let s = Some("Foo a bar\n".to_owned());
        assert_eq!(s, Option::<String>::from_argument(s.to_argument()).unwrap());
        assert_eq!(
            None,
            Option::<String>::from_argument(Option::<String>::None.to_argument()).unwrap()
        );
    }

    #[test]
    fn test_ret_code() {
        let code = RetCode::Invalid;
        assert_eq!(code, RetCode::from_argument(code.to_argument()).unwrap());
        assert!(RetCode::from_argument("sort-of-ok").is_err());
    }

    #[test]
    fn test_reply_ret_code() {
        let reply = Message::reply("watchdog", vec!["ok"]).unwrap();
        assert_eq!(RetCode::Ok, reply.ret_code().unwrap());

        let reply = Message::reply("watchdog", vec!["sideways"]).unwrap();
        assert!(reply.ret_code().is_err());

        let request = Message::request("watchdog", Vec::<String>::new()).unwrap();
        assert_eq!(Err(KatcpError::IncorrectType), request.ret_code());
    }
}
