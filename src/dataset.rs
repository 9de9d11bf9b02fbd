use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::CraftError;
use crate::sample::SampleAnnotation;

/// On-disk dataset description: JSON with `train` and `test` annotation
/// lists, plus an optional `fake` list for the synthetic source. Entries
/// are normalized on load so downstream code can rely on consistent
/// per-word counts.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub train: Vec<SampleAnnotation>,
    #[serde(default)]
    pub test: Vec<SampleAnnotation>,
    #[serde(default)]
    pub fake: Vec<SampleAnnotation>,
}

impl Manifest {
    #[instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Manifest, CraftError> {
        let file = File::open(path).map_err(|source| CraftError::Manifest {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;
        let manifest: Manifest =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| {
                CraftError::Manifest {
                    path: path.to_path_buf(),
                    source: Box::new(source),
                }
            })?;
        log::debug!(
            "manifest {}: {} train, {} test, {} fake",
            path.display(),
            manifest.train.len(),
            manifest.test.len(),
            manifest.fake.len()
        );
        Ok(Manifest {
            train: manifest.train.into_iter().map(normalize).collect(),
            test: manifest.test.into_iter().map(normalize).collect(),
            fake: manifest.fake.into_iter().map(normalize).collect(),
        })
    }
}

/// Truncates word boxes, words, char-box lists and confidences to their
/// common minimum count. Absent char-box lists stay empty (one per word)
/// and absent confidences default to 1.0.
pub fn normalize(mut annotation: SampleAnnotation) -> SampleAnnotation {
    let mut count = annotation.word_boxes.len().min(annotation.words.len());
    if !annotation.char_boxes.is_empty() {
        count = count.min(annotation.char_boxes.len());
    }
    annotation.word_boxes.truncate(count);
    annotation.words.truncate(count);
    annotation.char_boxes.truncate(count);
    annotation.char_boxes.resize_with(count, Vec::new);
    annotation.confidences.truncate(count);
    annotation.confidences.resize(count, 1.0);
    annotation
}
