//! Import-detect extensions: the pluggable first step of C6 (`spec.md`
//! §2 C6, §9 "import-detect extensions").

use std::path::Path;

use serde_json::Value as JsonValue;

/// What a [`Detector`] decided about a candidate path.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectOutcome {
    Accept {
        acq_name: String,
        /// Extension-provided type discriminator for the acquisition,
        /// if any (`spec.md` §3).
        acq_type: Option<String>,
        file_name: String,
        file_type: Option<String>,
        extra: Option<JsonValue>,
    },
    Decline,
}

/// A detector inspects a path relative to a node root and either
/// claims it (producing the acquisition/file naming) or declines,
/// letting the next detector in declared order try.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn detect(&self, rel_path: &Path) -> DetectOutcome;
}

/// The built-in detector: treats the first two path components as the
/// acquisition name (e.g. `2025/02/21/meta.txt` → acquisition
/// `2025/02/21`, file `meta.txt`), matching the example in `spec.md`
/// §8 scenario S1. Extensions may register stricter detectors ahead
/// of this one (C9); this one never declines, so it should always be
/// registered last.
pub struct DefaultDetector;

impl Detector for DefaultDetector {
    fn name(&self) -> &str {
        "default"
    }

    fn detect(&self, rel_path: &Path) -> DetectOutcome {
        let components: Vec<_> = rel_path.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
        if components.len() < 2 {
            return DetectOutcome::Decline;
        }
        let file_name = components.last().unwrap().clone();
        let acq_name = components[..components.len() - 1].join("/");

        DetectOutcome::Accept {
            acq_name,
            acq_type: None,
            file_name,
            file_type: None,
            extra: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_acquisition_prefix_from_file_name() {
        let d = DefaultDetector;
        let outcome = d.detect(Path::new("2025/02/21/meta.txt"));
        match outcome {
            DetectOutcome::Accept { acq_name, file_name, .. } => {
                assert_eq!(acq_name, "2025/02/21");
                assert_eq!(file_name, "meta.txt");
            }
            DetectOutcome::Decline => panic!("expected accept"),
        }
    }

    #[test]
    fn declines_a_bare_top_level_file() {
        let d = DefaultDetector;
        assert_eq!(d.detect(Path::new("README")), DetectOutcome::Decline);
    }
}
