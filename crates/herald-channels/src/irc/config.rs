//! IRC connection string
//!
//! Format: `address;port;nickname;use_ssl[;password_type;password]`

use herald_core::error::{ChatError, Result};
use std::fmt;
use std::str::FromStr;

/// How the password in a connection string is presented to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrcPasswordType {
    /// `PASS` during registration
    Server,
    /// `IDENTIFY` to NickServ once registered
    NickServ,
    /// SASL PLAIN before registration completes
    Sasl,
    /// `OPER` once registered
    Oper,
}

impl FromStr for IrcPasswordType {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(Self::Server),
            "nickserv" => Ok(Self::NickServ),
            "sasl" => Ok(Self::Sasl),
            "oper" => Ok(Self::Oper),
            other => Err(ChatError::config(format!(
                "unknown IRC password type '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct IrcCredentials {
    pub kind: IrcPasswordType,
    pub password: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct IrcConnectionString {
    pub address: String,
    pub port: u16,
    pub nickname: String,
    pub use_ssl: bool,
    pub credentials: Option<IrcCredentials>,
}

impl FromStr for IrcConnectionString {
    type Err = ChatError;

    fn from_str(s: &str) -> Result<Self> {
        // The password is last and keeps any ';' it contains
        let parts: Vec<&str> = s.splitn(6, ';').collect();
        if parts.len() != 4 && parts.len() != 6 {
            return Err(ChatError::config(format!(
                "IRC connection string needs 4 or 6 ';'-separated fields, got {}",
                parts.len()
            )));
        }

        let address = parts[0].trim();
        if address.is_empty() {
            return Err(ChatError::config("IRC server address is empty"));
        }

        let port = parts[1]
            .trim()
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| ChatError::config(format!("invalid IRC port '{}'", parts[1])))?;

        let nickname = parts[2].trim();
        if nickname.is_empty() || nickname.contains(' ') {
            return Err(ChatError::config(format!(
                "invalid IRC nickname '{}'",
                nickname
            )));
        }

        let use_ssl = parse_bool(parts[3])
            .ok_or_else(|| ChatError::config(format!("invalid IRC use_ssl flag '{}'", parts[3])))?;

        let credentials = if parts.len() == 6 {
            let kind = parts[4].parse::<IrcPasswordType>()?;
            if parts[5].is_empty() {
                return Err(ChatError::config("IRC password is empty"));
            }
            Some(IrcCredentials {
                kind,
                password: parts[5].to_string(),
            })
        } else {
            None
        };

        Ok(Self {
            address: address.to_string(),
            port,
            nickname: nickname.to_string(),
            use_ssl,
            credentials,
        })
    }
}

impl IrcConnectionString {
    pub fn password_for(&self, kind: IrcPasswordType) -> Option<&str> {
        self.credentials
            .as_ref()
            .filter(|c| c.kind == kind)
            .map(|c| c.password.as_str())
    }
}

impl fmt::Debug for IrcConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrcConnectionString")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("nickname", &self.nickname)
            .field("use_ssl", &self.use_ssl)
            .field(
                "credentials",
                &self.credentials.as_ref().map(|c| (c.kind, "***")),
            )
            .finish()
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let parsed: IrcConnectionString = "irc.example.org;6697;herald;true".parse().unwrap();
        assert_eq!(parsed.address, "irc.example.org");
        assert_eq!(parsed.port, 6697);
        assert_eq!(parsed.nickname, "herald");
        assert!(parsed.use_ssl);
        assert!(parsed.credentials.is_none());
    }

    #[test]
    fn test_parse_with_sasl() {
        let parsed: IrcConnectionString = "irc.example.org;6667;herald;false;SASL;hunter2"
            .parse()
            .unwrap();
        assert_eq!(parsed.password_for(IrcPasswordType::Sasl), Some("hunter2"));
        assert_eq!(parsed.password_for(IrcPasswordType::Server), None);
    }

    #[test]
    fn test_password_may_contain_separator_free_symbols() {
        let parsed: IrcConnectionString = "h;1;n;no;nickserv;p@ss:w0rd".parse().unwrap();
        assert_eq!(parsed.password_for(IrcPasswordType::NickServ), Some("p@ss:w0rd"));
    }

    #[test]
    fn test_password_keeps_semicolons() {
        let parsed: IrcConnectionString = "h;6667;n;no;sasl;pa;ss;word".parse().unwrap();
        assert_eq!(parsed.password_for(IrcPasswordType::Sasl), Some("pa;ss;word"));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "irc.example.org",
            "irc.example.org;notaport;herald;true",
            "irc.example.org;0;herald;true",
            "irc.example.org;6667;;true",
            "irc.example.org;6667;herald;maybe",
            "irc.example.org;6667;herald;true;kerberos;pw",
            "irc.example.org;6667;herald;true;sasl",
            "irc.example.org;6667;herald;true;sasl;",
        ] {
            let result = bad.parse::<IrcConnectionString>();
            assert!(
                matches!(result, Err(ChatError::Config { .. })),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_debug_masks_password() {
        let parsed: IrcConnectionString = "h;6667;n;true;oper;topsecret".parse().unwrap();
        let debug = format!("{:?}", parsed);
        assert!(!debug.contains("topsecret"));
        assert!(debug.contains("Oper"));
    }
}
