//! Engine-level name namespacing.
//!
//! The container engine has a flat namespace. Networks and volumes are
//! prefixed with the owning application id; containers encode the image and
//! release they were created from so that a listing can be mapped back to
//! the fleet model without any side database.

use std::fmt;

use crate::{AppId, IdError, ImageId, ReleaseId};

/// A network or volume name scoped to one application: `{appId}_{name}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopedName {
    pub app_id: AppId,
    pub name: String,
}

impl ScopedName {
    pub fn new(app_id: AppId, name: impl Into<String>) -> Self {
        Self {
            app_id,
            name: name.into(),
        }
    }

    /// Formats the engine-level name.
    #[must_use]
    pub fn engine_name(&self) -> String {
        format!("{}_{}", self.app_id, self.name)
    }

    /// Decomposes an engine-level name, which must match `^[0-9]+_.+$`.
    pub fn parse(engine_name: &str) -> Result<Self, IdError> {
        if engine_name.is_empty() {
            return Err(IdError::Empty);
        }
        let Some((app, name)) = engine_name.split_once('_') else {
            return Err(IdError::MissingSeparator(engine_name.to_string()));
        };
        if app.is_empty() || !app.bytes().all(|b| b.is_ascii_digit()) {
            return Err(IdError::InvalidFormat {
                message: format!("'{engine_name}' does not start with a numeric app id"),
            });
        }
        if name.is_empty() {
            return Err(IdError::InvalidFormat {
                message: format!("'{engine_name}' has an empty name"),
            });
        }
        Ok(Self {
            app_id: AppId::parse(app)?,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ScopedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.app_id, self.name)
    }
}

/// A container name: `{serviceName}_{imageId}_{releaseId}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerName {
    pub service_name: String,
    pub image_id: ImageId,
    pub release_id: ReleaseId,
}

impl ContainerName {
    pub fn new(service_name: impl Into<String>, image_id: ImageId, release_id: ReleaseId) -> Self {
        Self {
            service_name: service_name.into(),
            image_id,
            release_id,
        }
    }

    #[must_use]
    pub fn engine_name(&self) -> String {
        self.to_string()
    }

    /// Decomposes an engine container name. A leading `/`, as reported by
    /// engine inspection, is ignored.
    pub fn parse(engine_name: &str) -> Result<Self, IdError> {
        let trimmed = engine_name.strip_prefix('/').unwrap_or(engine_name);
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }
        let mut parts = trimmed.rsplitn(3, '_');
        let (Some(release), Some(image), Some(service)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::InvalidFormat {
                message: format!("'{trimmed}' is not of the form service_image_release"),
            });
        };
        if service.is_empty() {
            return Err(IdError::InvalidFormat {
                message: format!("'{trimmed}' has an empty service name"),
            });
        }
        Ok(Self {
            service_name: service.to_string(),
            image_id: ImageId::parse(image)?,
            release_id: ReleaseId::parse(release)?,
        })
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.service_name, self.image_id, self.release_id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn app(id: u32) -> AppId {
        AppId::new(id).unwrap()
    }

    #[test]
    fn test_scoped_name_keeps_inner_underscores() {
        let parsed = ScopedName::parse("1011165_my_net").unwrap();
        assert_eq!(parsed.app_id, app(1011165));
        assert_eq!(parsed.name, "my_net");
    }

    #[test]
    fn test_scoped_name_rejects_unscoped() {
        assert!(matches!(
            ScopedName::parse("bridge"),
            Err(IdError::MissingSeparator(_))
        ));
        assert!(matches!(
            ScopedName::parse("abc_default"),
            Err(IdError::InvalidFormat { .. })
        ));
        assert!(matches!(
            ScopedName::parse("12_"),
            Err(IdError::InvalidFormat { .. })
        ));
        assert!(ScopedName::parse("0_default").is_err());
    }

    #[test]
    fn test_container_name_parse() {
        let parsed = ContainerName::parse("/main_2937323_1220313").unwrap();
        assert_eq!(parsed.service_name, "main");
        assert_eq!(parsed.image_id.get(), 2937323);
        assert_eq!(parsed.release_id.get(), 1220313);
    }

    #[test]
    fn test_container_name_with_underscored_service() {
        let parsed = ContainerName::parse("my_service_1_2").unwrap();
        assert_eq!(parsed.service_name, "my_service");
    }

    #[test]
    fn test_container_name_rejects_unmanaged() {
        assert!(ContainerName::parse("nginx").is_err());
        assert!(ContainerName::parse("web_latest_3").is_err());
        assert!(ContainerName::parse("_1_2").is_err());
    }

    proptest! {
        #[test]
        fn scoped_name_roundtrip(id in 1u32..=u32::MAX, name in "[a-zA-Z0-9][a-zA-Z0-9_.-]{0,30}") {
            let scoped = ScopedName::new(app(id), name.clone());
            let parsed = ScopedName::parse(&scoped.engine_name()).unwrap();
            prop_assert_eq!(parsed.app_id, app(id));
            prop_assert_eq!(parsed.name, name);
        }

        #[test]
        fn container_name_roundtrip(
            service in "[a-z][a-z0-9_-]{0,20}",
            image in 1u32..=u32::MAX,
            release in 1u32..=u32::MAX,
        ) {
            let name = ContainerName::new(
                service.clone(),
                ImageId::new(image).unwrap(),
                ReleaseId::new(release).unwrap(),
            );
            let parsed = ContainerName::parse(&name.engine_name()).unwrap();
            prop_assert_eq!(parsed, name);
        }

        #[test]
        fn scoped_name_rejects_non_numeric_prefix(prefix in "[a-z]{1,8}", name in "[a-z]{1,8}") {
            let engine_name = format!("{prefix}_{name}");
            prop_assert!(ScopedName::parse(&engine_name).is_err());
        }
    }
}
