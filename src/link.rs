//! Извлечение идентификатора клиента из ссылки подключения.
//!
//! Ссылка вида `vless://<uuid>@host:port?...#remark` несёт UUID клиента между
//! схемой и хостом. Если UUID там не оказалось, берём хвост после последнего
//! `#` как email-идентификатор. Никакого I/O — чистый разбор строки.

use uuid::Uuid;

const LINK_SCHEME: &str = "vless://";

/// Идентификатор клиента панели: ровно одна непустая форма.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientIdentifier {
    Uuid(String),
    Email(String),
}

impl ClientIdentifier {
    pub fn as_str(&self) -> &str {
        match self {
            ClientIdentifier::Uuid(value) => value,
            ClientIdentifier::Email(value) => value,
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Достаёт идентификатор из ссылки. Неизвестная схема — `None`.
pub fn extract(link: &str) -> Option<ClientIdentifier> {
    let rest = link.trim().strip_prefix(LINK_SCHEME)?;

    if let Some(at) = rest.find('@') {
        let token = &rest[..at];
        if token.len() == 36 && Uuid::parse_str(token).is_ok() {
            return Some(ClientIdentifier::Uuid(token.to_ascii_lowercase()));
        }
    }

    let (_, fragment) = rest.rsplit_once('#')?;
    let decoded = urlencoding::decode(fragment)
        .map(|value| value.into_owned())
        .unwrap_or_else(|_| fragment.to_string());
    let trimmed = decoded.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(ClientIdentifier::Email(trimmed.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_uuid_between_scheme_and_host() {
        let link = "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@vpn.example.com:443?security=tls#user1";
        assert_eq!(
            extract(link),
            Some(ClientIdentifier::Uuid(
                "6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_string()
            ))
        );
    }

    #[test]
    fn uuid_wins_over_remark() {
        let link = "vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@host#remark";
        match extract(link) {
            Some(ClientIdentifier::Uuid(_)) => {}
            other => panic!("ожидался UUID, получено {:?}", other),
        }
    }

    #[test]
    fn uuid_is_lowercased() {
        let link = "vless://6BA7B810-9DAD-11D1-80B4-00C04FD430C8@host:443";
        assert_eq!(
            extract(link),
            Some(ClientIdentifier::Uuid(
                "6ba7b810-9dad-11d1-80b4-00c04fd430c8".to_string()
            ))
        );
    }

    #[test]
    fn falls_back_to_fragment_email() {
        let link = "vless://not-a-uuid@host:443#user1%40example.com";
        assert_eq!(
            extract(link),
            Some(ClientIdentifier::Email("user1@example.com".to_string()))
        );
    }

    #[test]
    fn wrong_scheme_is_absent() {
        assert_eq!(extract("trojan://abc@host#x"), None);
        assert_eq!(extract("просто текст"), None);
        assert_eq!(extract(""), None);
    }

    #[test]
    fn empty_fragment_is_absent() {
        assert_eq!(extract("vless://not-a-uuid@host:443#"), None);
        assert_eq!(extract("vless://not-a-uuid@host:443"), None);
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let link = "  vless://6ba7b810-9dad-11d1-80b4-00c04fd430c8@host  ";
        assert!(matches!(extract(link), Some(ClientIdentifier::Uuid(_))));
    }
}
