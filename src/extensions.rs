//! C9 — Extensions.
//!
//! `spec.md` §9 flags dynamic-library loading (`dlopen` of
//! operator-supplied `.so` files) as a redesign candidate: ABI
//! compatibility across a daemon upgrade is a maintenance burden this
//! rewrite does not take on. Extensions are instead Rust types
//! compiled into the binary and looked up by name from a fixed
//! registry; an unknown name in `extensions:` is a startup error
//! (exit code 3, `spec.md` §6), not a missing-file error discovered
//! mid-run.

use anyhow::{bail, Result};

use crate::importer::Detector;

/// A compile-time-registered extension. Each one may contribute
/// import-detect logic ahead of the built-in default detector
/// (`spec.md` §9 "import-detect extensions").
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    /// Append this extension's detectors, in the order they should be
    /// tried (before the built-in default, which never declines).
    fn detectors(&self) -> Vec<Box<dyn Detector>> {
        Vec::new()
    }
}

/// No extensions ship in this build; operators wire in their own by
/// adding a match arm here and recompiling. This keeps the contract
/// spec.md asks for — "new capability requires a rebuild, not a
/// dropped-in file" — visible at the one call site that matters.
fn lookup(name: &str) -> Option<Box<dyn Extension>> {
    match name {
        _ => None,
    }
}

/// Resolve every configured extension name, in order. Fails loudly on
/// the first unknown name rather than silently skipping it.
pub fn load(names: &[String]) -> Result<Vec<Box<dyn Extension>>> {
    let mut loaded = Vec::with_capacity(names.len());
    for name in names {
        match lookup(name) {
            Some(ext) => {
                log::info!("loaded extension {:?}", ext.name());
                loaded.push(ext);
            }
            None => bail!("unknown extension {:?}; known extensions are compiled in, not discovered", name),
        }
    }
    Ok(loaded)
}

/// Flatten the detectors every loaded extension contributes, in
/// load order, ahead of the built-in default detector.
pub fn collect_detectors(extensions: &[Box<dyn Extension>]) -> Vec<Box<dyn Detector>> {
    let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
    for ext in extensions {
        detectors.extend(ext.detectors());
    }
    detectors.push(Box::new(crate::importer::DefaultDetector));
    detectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_extension_name_is_rejected() {
        let result = load(&["does-not-exist".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn empty_extension_list_is_fine() {
        assert!(load(&[]).unwrap().is_empty());
    }

    #[test]
    fn collect_detectors_always_ends_with_the_default() {
        let detectors = collect_detectors(&[]);
        assert_eq!(detectors.len(), 1);
        assert_eq!(detectors[0].name(), "default");
    }
}
