use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Invalid {field} value: {value}")]
pub struct InvalidEnum {
    pub field: String,
    pub value: String,
}

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = InvalidEnum;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }
    };
}

str_enum!(MessageRole {
    User => "user",
    Agent => "agent",
    System => "system",
});

impl MessageRole {
    /// Role name expected by chat-completion endpoints.
    pub fn api_role(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "assistant",
            Self::System => "system",
        }
    }
}

str_enum!(DocumentKind {
    Image => "image",
    PlainText => "plain_text",
    Pdf => "pdf",
    Other => "other",
});

impl DocumentKind {
    /// Whether extraction for this kind may end up in OCR.
    pub fn may_need_ocr(&self) -> bool {
        matches!(self, Self::Image | Self::Pdf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn message_role_round_trip() {
        for (variant, s) in [
            (MessageRole::User, "user"),
            (MessageRole::Agent, "agent"),
            (MessageRole::System, "system"),
        ] {
            assert_eq!(variant.as_str(), s);
            assert_eq!(MessageRole::from_str(s).unwrap(), variant);
        }
    }

    #[test]
    fn agent_maps_to_assistant_for_api() {
        assert_eq!(MessageRole::Agent.api_role(), "assistant");
        assert_eq!(MessageRole::User.api_role(), "user");
    }

    #[test]
    fn invalid_role_rejected() {
        let err = MessageRole::from_str("assistant").unwrap_err();
        assert_eq!(err.field, "MessageRole");
        assert_eq!(err.value, "assistant");
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&MessageRole::Agent).unwrap();
        assert_eq!(json, "\"agent\"");
    }

    #[test]
    fn document_kind_ocr_candidates() {
        assert!(DocumentKind::Image.may_need_ocr());
        assert!(DocumentKind::Pdf.may_need_ocr());
        assert!(!DocumentKind::PlainText.may_need_ocr());
        assert!(!DocumentKind::Other.may_need_ocr());
    }
}
