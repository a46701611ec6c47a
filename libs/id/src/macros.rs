//! Macros for defining typed name and ID types.

/// Maximum length of a name, in characters.
pub const MAX_NAME_LEN: usize = 128;

/// Macro to define a typed, validated name.
///
/// This generates a newtype wrapper around `String` with:
/// - A `KIND` constant used in error messages
/// - `parse()` to validate a string (non-empty, bounded, no whitespace or
///   control characters)
/// - `as_str()`, `Display`, `FromStr`, `Borrow<str>`
/// - `Serialize` and `Deserialize` implementations that validate
/// - `Ord` (lexicographic), `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_name!(IsolateId, "isolate id");
///
/// let id: IsolateId = "iso-A".parse()?;
/// ```
#[macro_export]
macro_rules! define_name {
    ($name:ident, $kind:literal) => {
        /// A validated name for this resource type.
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            /// Human-readable kind, used in error messages.
            pub const KIND: &'static str = $kind;

            /// Parses and validates a name.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }

                let len = s.chars().count();
                if len > $crate::MAX_NAME_LEN {
                    return Err($crate::IdError::TooLong {
                        kind: Self::KIND,
                        len,
                        max: $crate::MAX_NAME_LEN,
                    });
                }

                if let Some(found) = s.chars().find(|c| c.is_whitespace() || c.is_control()) {
                    return Err($crate::IdError::InvalidCharacter {
                        kind: Self::KIND,
                        found,
                    });
                }

                Ok(Self(s.to_string()))
            }

            /// Returns the name as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<&str> for $name {
            type Error = $crate::IdError;

            fn try_from(s: &str) -> Result<Self, Self::Error> {
                Self::parse(s)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}

/// Defines a system-generated, ULID-backed ID written as `{prefix}_{ulid}`.
///
/// ```ignore
/// define_id!(CommandId, "cmd");
///
/// let id = CommandId::new();
/// let parsed: CommandId = "cmd_01HV4Z2WQXKJNM8GPQY6VBKC3D".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name($crate::Ulid);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            /// A fresh ID. IDs created later sort later.
            #[must_use]
            pub fn new() -> Self {
                Self($crate::Ulid::new())
            }

            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                let (prefix, ulid) = s
                    .split_once('_')
                    .ok_or($crate::IdError::MissingSeparator)?;
                if prefix != Self::PREFIX {
                    return Err($crate::IdError::InvalidPrefix {
                        expected: Self::PREFIX,
                        actual: prefix.to_string(),
                    });
                }
                ulid.parse::<$crate::Ulid>()
                    .map(Self)
                    .map_err(|e| $crate::IdError::InvalidUlid(e.to_string()))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}_{}", Self::PREFIX, self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Self::parse(&s).map_err(serde::de::Error::custom)
            }
        }
    };
}
