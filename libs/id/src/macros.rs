//! Macros for defining typed ID types.

/// Macro to define a typed integer ID.
///
/// This generates a newtype wrapper around `u32` with:
/// - A `KIND` constant used in error messages
/// - `new()` which rejects zero, and `get()` for the raw value
/// - `Display` and `FromStr` implementations (plain decimal)
/// - `Serialize` and `Deserialize` implementations (numbers, or decimal
///   strings so the type also works as a JSON object key)
/// - `Ord`, `Hash`, and other standard traits
///
/// # Example
///
/// ```ignore
/// define_id!(AppId, "app id");
///
/// let app_id = AppId::new(1011165)?;
/// let parsed: AppId = "1011165".parse()?;
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident, $kind:literal) => {
        /// A typed ID for this resource type.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            /// Human-readable kind, used in error messages.
            pub const KIND: &'static str = $kind;

            /// Creates an ID from a raw value, rejecting zero.
            pub fn new(value: u32) -> Result<Self, $crate::IdError> {
                if value == 0 {
                    return Err($crate::IdError::Zero { kind: $kind });
                }
                Ok(Self(value))
            }

            /// Returns the underlying integer.
            #[must_use]
            pub const fn get(&self) -> u32 {
                self.0
            }

            /// Parses an ID from its decimal representation.
            pub fn parse(s: &str) -> Result<Self, $crate::IdError> {
                if s.is_empty() {
                    return Err($crate::IdError::Empty);
                }
                if !s.bytes().all(|b| b.is_ascii_digit()) {
                    return Err($crate::IdError::NotAnInteger {
                        kind: $kind,
                        value: s.to_string(),
                    });
                }
                let value = s
                    .parse::<u32>()
                    .map_err(|_| $crate::IdError::NotAnInteger {
                        kind: $kind,
                        value: s.to_string(),
                    })?;
                Self::new(value)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = $crate::IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }

        impl TryFrom<u32> for $name {
            type Error = $crate::IdError;

            fn try_from(value: u32) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.serialize_u32(self.0)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                struct IdVisitor;

                impl serde::de::Visitor<'_> for IdVisitor {
                    type Value = $name;

                    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                        write!(f, "a positive integer {}", $kind)
                    }

                    fn visit_u64<E: serde::de::Error>(self, v: u64) -> Result<$name, E> {
                        let v = u32::try_from(v).map_err(E::custom)?;
                        $name::new(v).map_err(E::custom)
                    }

                    fn visit_i64<E: serde::de::Error>(self, v: i64) -> Result<$name, E> {
                        let v = u32::try_from(v).map_err(E::custom)?;
                        $name::new(v).map_err(E::custom)
                    }

                    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<$name, E> {
                        $name::parse(v).map_err(E::custom)
                    }
                }

                deserializer.deserialize_any(IdVisitor)
            }
        }
    };
}
