use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

/// Correlates a frame connection with the control channel session of the same peer. It is
///  handed out on CONNECT (if the server is configured to acknowledge CONNECT) and may be echoed
///  back in a frame header's `data.session_token`.
///
/// NB: This is not a security feature - tokens are random to avoid accidental collisions between
///      peers behind the same NAT address, not to be unguessable.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct SessionToken(pub u64);
impl SessionToken {
    pub fn random() -> SessionToken {
        SessionToken(rand::random())
    }
}

impl Display for SessionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
impl Debug for SessionToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SessionToken({})", self)
    }
}

impl FromStr for SessionToken {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(SessionToken)
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case(SessionToken(0), "0000000000000000")]
    #[case(SessionToken(0x1234_abcd), "000000001234abcd")]
    #[case(SessionToken(u64::MAX), "ffffffffffffffff")]
    fn test_display_and_parse(#[case] token: SessionToken, #[case] expected: &str) {
        assert_eq!(token.to_string(), expected);
        assert_eq!(SessionToken::from_str(expected).unwrap(), token);
    }

    #[rstest]
    #[case("")]
    #[case("xyz")]
    #[case("1ffffffffffffffff")]
    fn test_parse_invalid(#[case] s: &str) {
        assert!(SessionToken::from_str(s).is_err());
    }
}
