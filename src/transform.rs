//! Transform presets: the "named, pre-registered record transform" external
//! collaborator named in spec §6. The core only defines and invokes this
//! interface — concrete vendor presets (e.g. adapting records to a specific
//! analytics provider's schema) are out of scope per spec §1 and are left
//! for callers to implement.

/// A named transform applied before the caller's own `transform`, once per
/// record (spec §4.2).
pub trait TransformPreset<R>: Send + Sync {
    fn apply(&self, record: R) -> Result<R, String>;
}

/// The identity preset; useful as a registry placeholder and in tests.
pub struct IdentityPreset;

impl<R> TransformPreset<R> for IdentityPreset {
    fn apply(&self, record: R) -> Result<R, String> {
        Ok(record)
    }
}
