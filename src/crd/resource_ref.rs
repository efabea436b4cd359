//! # Resource References
//!
//! A typed pointer to a value held in one of four places.

use serde::{Deserialize, Serialize};

/// Reference to a string value
///
/// Serialized with a `type` discriminator next to the variant body, e.g.
/// `{"type": "Secret", "secret": {"name": "db", "key": "password"}}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
#[serde(tag = "type")]
pub enum ResourceRef {
    Literal { literal: LiteralSelector },
    Env { env: EnvSelector },
    #[serde(rename = "FS")]
    FileSystem { filesystem: FileSystemSelector },
    Secret { secret: SecretSelector },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LiteralSelector {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct EnvSelector {
    /// Environment variable of the controller process
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct FileSystemSelector {
    /// Path on the controller's filesystem
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct SecretSelector {
    /// Defaults to the Stack's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    pub key: String,
}

impl ResourceRef {
    pub fn literal(value: impl Into<String>) -> Self {
        Self::Literal {
            literal: LiteralSelector {
                value: value.into(),
            },
        }
    }

    pub fn env(name: impl Into<String>) -> Self {
        Self::Env {
            env: EnvSelector { name: name.into() },
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self::FileSystem {
            filesystem: FileSystemSelector { path: path.into() },
        }
    }

    pub fn secret(namespace: Option<&str>, name: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Secret {
            secret: SecretSelector {
                namespace: namespace.map(str::to_string),
                name: name.into(),
                key: key.into(),
            },
        }
    }

    /// Variant name as it appears in the `type` field
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Literal { .. } => "Literal",
            Self::Env { .. } => "Env",
            Self::FileSystem { .. } => "FS",
            Self::Secret { .. } => "Secret",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(ResourceRef::secret(None, "db", "password")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"type": "Secret", "secret": {"name": "db", "key": "password"}})
        );

        let fs: ResourceRef = serde_json::from_value(serde_json::json!({
            "type": "FS",
            "filesystem": {"path": "/var/run/token"}
        }))
        .unwrap();
        assert_eq!(fs, ResourceRef::file("/var/run/token"));
        assert_eq!(fs.kind(), "FS");
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let result: Result<ResourceRef, _> = serde_json::from_value(serde_json::json!({
            "type": "Vault",
            "vault": {"path": "x"}
        }));
        assert!(result.is_err());
    }
}
