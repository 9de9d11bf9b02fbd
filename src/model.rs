use std::path::{Path, PathBuf};

use ndarray::{Array3, ArrayView4, Axis, Ix4};
use ort::{inputs, ExecutionProviderDispatch, GraphOptimizationLevel, Session};
use tracing::instrument;

use crate::error::CraftError;
use crate::sample::Quad;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionProvider {
    Default,
    #[cfg(feature = "tensorrt")]
    TensorRT,
    #[cfg(feature = "coreml")]
    CoreML,
    #[cfg(feature = "cuda")]
    Cuda,
    #[cfg(feature = "directml")]
    DirectML,
}

pub const DEFAULT_PROVIDERS: &[ExecutionProvider] = &[
    #[cfg(feature = "tensorrt")]
    ExecutionProvider::TensorRT,
    #[cfg(feature = "coreml")]
    ExecutionProvider::CoreML,
    #[cfg(feature = "directml")]
    ExecutionProvider::DirectML,
    #[cfg(feature = "cuda")]
    ExecutionProvider::Cuda,
    ExecutionProvider::Default,
];

#[cfg(feature = "tensorrt")]
fn setup_tensorrt(cache_path: PathBuf, canvas_size: u32) -> ExecutionProviderDispatch {
    use ort::TensorRTExecutionProvider;

    TensorRTExecutionProvider::default()
        .with_profile_min_shapes("image:1x3x32x32")
        .with_profile_max_shapes(format!("image:32x3x{canvas_size}x{canvas_size}"))
        .with_profile_opt_shapes(format!("image:1x3x{canvas_size}x{canvas_size}"))
        .with_engine_cache(true)
        .with_engine_cache_path(cache_path.to_string_lossy())
        .with_timing_cache(true)
        .build()
}

#[cfg(feature = "cuda")]
fn setup_cuda() -> ExecutionProviderDispatch {
    use ort::CUDAExecutionProvider;

    CUDAExecutionProvider::default().build()
}

#[cfg(feature = "directml")]
fn setup_directml() -> ExecutionProviderDispatch {
    use ort::DirectMLExecutionProvider;

    DirectMLExecutionProvider::default().build()
}

/// Region and affinity predictions for one batch, NCHW channel 0 and 1 of
/// the network output, each at half the input resolution.
#[derive(Debug)]
pub struct Heatmaps {
    pub region: Array3<f32>,
    pub affinity: Array3<f32>,
}

/// Forward-only wrapper around a trained detection network. Training the
/// weights happens outside this crate; the session here serves loss
/// diagnostics and model-in-the-loop estimation on the synthetic path.
pub struct CraftNet {
    session: Session,
}

impl CraftNet {
    #[instrument(level = "debug")]
    pub fn init(
        path: PathBuf,
        num_threads: usize,
        canvas_size: u32,
        execution_providers: &[ExecutionProvider],
        cache_path: Option<PathBuf>,
    ) -> ort::Result<Self> {
        #[cfg(feature = "directml")]
        let parallel = execution_providers.contains(&ExecutionProvider::DirectML);
        #[cfg(not(feature = "directml"))]
        let parallel = true;

        let execution_providers = execution_providers.iter().filter_map(
            |provider| -> Option<ExecutionProviderDispatch> {
                match provider {
                    ExecutionProvider::Default => None,
                    #[cfg(feature = "tensorrt")]
                    ExecutionProvider::TensorRT => Some(setup_tensorrt(
                        cache_path
                            .clone()
                            .unwrap_or_else(|| path.parent().unwrap().join(".cache")),
                        canvas_size,
                    )),
                    #[cfg(feature = "coreml")]
                    ExecutionProvider::CoreML => None,
                    #[cfg(feature = "cuda")]
                    ExecutionProvider::Cuda => Some(setup_cuda()),
                    #[cfg(feature = "directml")]
                    ExecutionProvider::DirectML => Some(setup_directml()),
                }
            },
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_memory_pattern(parallel)?
            .with_parallel_execution(parallel)?
            .with_inter_threads(num_threads)?
            .with_intra_threads(num_threads)?
            .with_execution_providers(execution_providers)?
            .commit_from_file(path)?;

        log::debug!("net inputs: {:?}", session.inputs);
        log::debug!("net outputs: {:?}", session.outputs);

        Ok(Self { session })
    }

    /// Runs one forward pass over a normalized `(n, 3, h, w)` batch and
    /// splits the two-channel output into region and affinity maps. The
    /// network's shared feature map output is not consumed here.
    #[instrument(level = "debug", skip(self, images))]
    pub fn forward(&self, images: ArrayView4<f32>) -> Result<Heatmaps, CraftError> {
        let inputs = inputs!["image" => images.to_owned()]?;
        let outputs = self.session.run(inputs)?;
        let tensor = outputs
            .first_key_value()
            .unwrap()
            .1
            .try_extract_tensor::<f32>()?;

        let heatmaps = tensor
            .to_owned()
            .into_dimensionality::<Ix4>()
            .map_err(|_| CraftError::ShapeMismatch {
                expected: vec![images.len_of(Axis(0)), 2],
                actual: tensor.shape().to_vec(),
            })?;
        if heatmaps.len_of(Axis(1)) != 2 {
            return Err(CraftError::ShapeMismatch {
                expected: vec![heatmaps.len_of(Axis(0)), 2],
                actual: heatmaps.shape().to_vec(),
            });
        }

        Ok(Heatmaps {
            region: heatmaps.index_axis(Axis(1), 0).to_owned(),
            affinity: heatmaps.index_axis(Axis(1), 1).to_owned(),
        })
    }
}

/// Splits a word annotation into per-character boxes with an estimation
/// confidence, used where the dataset carries no character annotations
/// (the synthetic path). How the split is computed is up to the
/// implementation; [`CraftNet::forward`] provides the inference pass an
/// implementation would typically build on.
pub trait CharBoxEstimator {
    fn estimate(
        &self,
        image: &Path,
        word_box: &Quad,
        word_length: usize,
    ) -> Result<(Vec<Quad>, f32), CraftError>;
}
