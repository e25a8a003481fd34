//! Parsing of the `katcp-protocol` version string from the `#version-connect`
//! handshake and the feature queries derived from it

use std::{collections::HashSet, fmt::Display, str::FromStr};

use crate::protocol::KatcpError;

#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
/// Feature flags a server may advertise in its `katcp-protocol` version string
pub enum ProtocolFlag {
    /// The server supports message identifiers
    MessageIds,
    /// A flag token this library does not know about. Preserved so the
    /// version string round-trips
    Unknown(char),
}

impl ProtocolFlag {
    fn token(&self) -> char {
        match self {
            ProtocolFlag::MessageIds => 'M',
            ProtocolFlag::Unknown(c) => *c,
        }
    }
}

impl Display for ProtocolFlag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

impl From<char> for ProtocolFlag {
    fn from(value: char) -> Self {
        match value {
            'M' => Self::MessageIds,
            c => Self::Unknown(c),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
/// The protocol version and feature set a server advertised in its
/// `#version-connect katcp-protocol <major>.<minor>[-flags]` inform.
///
/// Latched once per connection and cleared again on disconnect.
pub struct ProtocolInfo {
    pub major: u32,
    pub minor: u32,
    flags: HashSet<ProtocolFlag>,
}

impl ProtocolInfo {
    pub fn new(major: u32, minor: u32, flags: impl IntoIterator<Item = ProtocolFlag>) -> Self {
        Self {
            major,
            minor,
            flags: flags.into_iter().collect(),
        }
    }

    /// Whether the server advertised a feature.
    ///
    /// Message id support is implied by protocol version five and up even
    /// when the `M` token is absent.
    pub fn supports(&self, flag: ProtocolFlag) -> bool {
        if self.flags.contains(&flag) {
            return true;
        }
        flag == ProtocolFlag::MessageIds && self.major >= 5
    }
}

impl FromStr for ProtocolInfo {
    type Err = KatcpError;

    /// Parses `<major>.<minor>[-flags]`, flags being comma-separated tokens
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (major, minor_and_flags) = s
            .split_once('.')
            .ok_or_else(|| KatcpError::BadArgument(s.to_owned()))?;
        let major = major
            .parse()
            .map_err(|_| KatcpError::BadArgument(s.to_owned()))?;
        let (minor, flags) = match minor_and_flags.split_once('-') {
            Some((minor, flagset)) => {
                let flags = flagset
                    .split(',')
                    .flat_map(str::chars)
                    .map(ProtocolFlag::from)
                    .collect();
                (minor, flags)
            }
            None => (minor_and_flags, HashSet::new()),
        };
        let minor = minor
            .parse()
            .map_err(|_| KatcpError::BadArgument(s.to_owned()))?;
        Ok(Self {
            major,
            minor,
            flags,
        })
    }
}

impl Display for ProtocolInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if !self.flags.is_empty() {
            let mut tokens: Vec<char> = self.flags.iter().map(ProtocolFlag::token).collect();
            tokens.sort_unstable();
            write!(f, "-")?;
            for token in tokens {
                write!(f, "{}", token)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_flags() {
        let info: ProtocolInfo = "5.0-M".parse().unwrap();
        assert_eq!(info.major, 5);
        assert_eq!(info.minor, 0);
        assert!(info.supports(ProtocolFlag::MessageIds));
    }

    #[test]
    fn test_mids_implied_by_major() {
        let info: ProtocolInfo = "5.1".parse().unwrap();
        assert!(info.supports(ProtocolFlag::MessageIds));
    }

    #[test]
    fn test_legacy_version() {
        let info: ProtocolInfo = "4.0".parse().unwrap();
        assert!(!info.supports(ProtocolFlag::MessageIds));
    }

    #[test]
    fn test_unknown_flags_preserved() {
        let info: ProtocolInfo = "4.9-MX".parse().unwrap();
        assert!(info.supports(ProtocolFlag::MessageIds));
        assert!(info.supports(ProtocolFlag::Unknown('X')));
        assert!(!info.supports(ProtocolFlag::Unknown('Y')));
        assert_eq!(info.to_string(), "4.9-MX");
    }

    #[test]
    fn test_comma_separated_flags() {
        let info: ProtocolInfo = "5.0-M,T".parse().unwrap();
        assert!(info.supports(ProtocolFlag::MessageIds));
        assert!(info.supports(ProtocolFlag::Unknown('T')));
    }

    #[test]
    fn test_bad_versions() {
        assert!("5".parse::<ProtocolInfo>().is_err());
        assert!("five.0".parse::<ProtocolInfo>().is_err());
        assert!("5.x".parse::<ProtocolInfo>().is_err());
    }

    #[test]
    fn test_roundtrip() {
        let info = ProtocolInfo::new(5, 0, [ProtocolFlag::MessageIds]);
        assert_eq!(info, info.to_string().parse().unwrap());
    }
}
