//! Typed ID definitions for fleet-assigned identifiers.

use crate::define_id;

// =============================================================================
// Application Model
// =============================================================================

define_id!(AppId, "app id");
define_id!(ReleaseId, "release id");

// =============================================================================
// Services and Images
// =============================================================================

define_id!(ServiceId, "service id");
define_id!(ImageId, "image id");
