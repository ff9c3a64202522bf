// src/classifier.rs - Pose classification: capability, bridge and dense-network model
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ClassifierError;
use crate::keypoints::FEATURE_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Classification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierOptions {
    pub input_size: usize,
    pub output_size: usize,
    pub task: Task,
}

impl Default for ClassifierOptions {
    fn default() -> Self {
        Self {
            input_size: FEATURE_LEN,
            output_size: 5,
            task: Task::Classification,
        }
    }
}

/// Where the three model assets live. Each entry is an http(s) URL or a file path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSource {
    pub model: String,
    pub metadata: String,
    pub weights: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: String,
    pub confidence: f32,
}

/// One classifier response, ranked by confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    pub ranked: Vec<Classification>,
    pub received_at: DateTime<Local>,
}

impl ClassificationResult {
    pub fn top(&self) -> Option<&Classification> {
        self.ranked.first()
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, input: &[f32]) -> Result<Vec<Classification>, ClassifierError>;
}

#[async_trait]
pub trait ClassifierLoader: Send + Sync {
    async fn load(
        &self,
        options: &ClassifierOptions,
        source: &ModelSource,
    ) -> Result<Arc<dyn Classifier>, ClassifierError>;
}

enum BridgeState {
    /// No classifier configured, or loading not requested yet.
    Idle,
    Loading(JoinHandle<Result<Arc<dyn Classifier>, ClassifierError>>),
    Ready(Arc<dyn Classifier>),
    Failed,
}

/// Forwards per-frame features to the classifier once it has loaded and keeps
/// the most recent result for display.
pub struct ClassificationBridge {
    setup: Option<(Arc<dyn ClassifierLoader>, ClassifierOptions, ModelSource)>,
    state: BridgeState,
    load_requested: bool,
    latest: Option<Arc<ClassificationResult>>,
}

impl ClassificationBridge {
    pub fn new(loader: Arc<dyn ClassifierLoader>, options: ClassifierOptions, source: ModelSource) -> Self {
        Self {
            setup: Some((loader, options, source)),
            state: BridgeState::Idle,
            load_requested: false,
            latest: None,
        }
    }

    pub fn disabled() -> Self {
        Self {
            setup: None,
            state: BridgeState::Idle,
            load_requested: false,
            latest: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.setup.is_some()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, BridgeState::Ready(_))
    }

    pub fn latest(&self) -> Option<Arc<ClassificationResult>> {
        self.latest.clone()
    }

    /// Starts loading the model in the background. Only the first call has
    /// any effect; later calls (e.g. after a detector rebuild) are ignored.
    pub fn start_loading(&mut self) {
        if self.load_requested {
            return;
        }
        let Some((loader, options, source)) = self.setup.clone() else {
            return;
        };
        self.load_requested = true;
        info!(model = %source.model, "loading pose classifier");
        self.state = BridgeState::Loading(tokio::spawn(async move {
            loader.load(&options, &source).await
        }));
    }

    async fn poll_loading(&mut self) {
        let BridgeState::Loading(handle) = &self.state else {
            return;
        };
        if !handle.is_finished() {
            return;
        }
        let BridgeState::Loading(handle) = std::mem::replace(&mut self.state, BridgeState::Failed) else {
            return;
        };
        match handle.await {
            Ok(Ok(classifier)) => {
                info!("pose classifier ready");
                self.state = BridgeState::Ready(classifier);
            }
            Ok(Err(e)) => error!("pose classifier failed to load: {}", e),
            Err(e) => error!("pose classifier load task aborted: {}", e),
        }
    }

    /// Classifies one frame's features. A no-op until the classifier is ready.
    /// A failed classification keeps the previous result.
    pub async fn on_frame(&mut self, features: &[f32]) {
        self.poll_loading().await;
        let BridgeState::Ready(classifier) = &self.state else {
            return;
        };
        match classifier.classify(features).await {
            Ok(ranked) => {
                debug!(top = ?ranked.first(), "classification");
                self.latest = Some(Arc::new(ClassificationResult {
                    ranked,
                    received_at: Local::now(),
                }));
            }
            Err(e) => warn!("classification failed, keeping previous result: {}", e),
        }
    }
}

impl Drop for ClassificationBridge {
    fn drop(&mut self) {
        if let BridgeState::Loading(handle) = &self.state {
            handle.abort();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
}

impl Activation {
    fn parse(name: &str) -> Result<Self, ClassifierError> {
        match name {
            "linear" => Ok(Self::Linear),
            "relu" => Ok(Self::Relu),
            "sigmoid" => Ok(Self::Sigmoid),
            "tanh" => Ok(Self::Tanh),
            "softmax" => Ok(Self::Softmax),
            other => Err(ClassifierError::Shape(format!("unsupported activation {other}"))),
        }
    }

    fn apply(self, v: &mut DVector<f32>) {
        match self {
            Self::Linear => {}
            Self::Relu => v.apply(|x| *x = x.max(0.0)),
            Self::Sigmoid => v.apply(|x| *x = 1.0 / (1.0 + (-*x).exp())),
            Self::Tanh => v.apply(|x| *x = x.tanh()),
            Self::Softmax => {
                let max = v.max();
                v.apply(|x| *x = (*x - max).exp());
                let sum = v.sum();
                if sum > 0.0 {
                    *v /= sum;
                }
            }
        }
    }
}

struct DenseLayer {
    /// `inputs x units`
    kernel: DMatrix<f32>,
    bias: Option<DVector<f32>>,
    activation: Activation,
}

impl DenseLayer {
    fn forward(&self, x: &DVector<f32>) -> DVector<f32> {
        let mut out = self.kernel.tr_mul(x);
        if let Some(bias) = &self.bias {
            out += bias;
        }
        self.activation.apply(&mut out);
        out
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ModelJson {
    model_topology: TopologyJson,
    weights_manifest: Vec<WeightGroupJson>,
}

#[derive(Deserialize)]
struct TopologyJson {
    config: TopologyConfigJson,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TopologyConfigJson {
    Sequential { layers: Vec<LayerJson> },
    Bare(Vec<LayerJson>),
}

#[derive(Deserialize)]
struct LayerJson {
    class_name: String,
    #[serde(default)]
    config: Value,
}

#[derive(Deserialize)]
struct WeightGroupJson {
    weights: Vec<WeightSpecJson>,
}

#[derive(Deserialize)]
struct WeightSpecJson {
    name: String,
    shape: Vec<usize>,
    #[serde(default = "default_dtype")]
    dtype: String,
}

fn default_dtype() -> String {
    "float32".to_string()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataJson {
    #[serde(default)]
    is_normalized: bool,
    #[serde(default)]
    inputs: serde_json::Map<String, Value>,
    #[serde(default)]
    outputs: serde_json::Map<String, Value>,
}

/// Feed-forward network in the TensorFlow.js layers format.
pub struct DenseClassifier {
    layers: Vec<DenseLayer>,
    labels: Vec<String>,
    /// Per-input `(min, max)`, applied when the model was trained on normalized data.
    normalization: Option<Vec<(f32, f32)>>,
}

impl std::fmt::Debug for DenseClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DenseClassifier")
            .field("layers", &self.layers.len())
            .field("labels", &self.labels)
            .field("normalized", &self.normalization.is_some())
            .finish()
    }
}

impl DenseClassifier {
    pub fn from_parts(
        model: &[u8],
        metadata: &[u8],
        weights: &[u8],
        options: &ClassifierOptions,
    ) -> Result<Self, ClassifierError> {
        let model: ModelJson =
            serde_json::from_slice(model).map_err(|source| ClassifierError::Parse { what: "topology", source })?;
        let metadata: MetadataJson =
            serde_json::from_slice(metadata).map_err(|source| ClassifierError::Parse { what: "metadata", source })?;

        let layers = build_layers(model, weights)?;
        let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
            return Err(ClassifierError::Shape("model has no dense layers".to_string()));
        };
        if first.kernel.nrows() != options.input_size {
            return Err(ClassifierError::Shape(format!(
                "model takes {} inputs, expected {}",
                first.kernel.nrows(),
                options.input_size
            )));
        }
        let units = last.kernel.ncols();
        if units != options.output_size {
            return Err(ClassifierError::Shape(format!(
                "model has {} outputs, expected {}",
                units, options.output_size
            )));
        }

        let labels = output_labels(&metadata.outputs, units);
        let normalization = if metadata.is_normalized {
            Some(input_ranges(&metadata.inputs, options.input_size)?)
        } else {
            None
        };

        Ok(Self {
            layers,
            labels,
            normalization,
        })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn predict(&self, input: &[f32]) -> Result<Vec<Classification>, ClassifierError> {
        let expected = self.layers.first().map_or(0, |l| l.kernel.nrows());
        if input.len() != expected {
            return Err(ClassifierError::InputSize {
                expected,
                actual: input.len(),
            });
        }

        let mut x = DVector::from_column_slice(input);
        if let Some(ranges) = &self.normalization {
            for (value, &(min, max)) in x.iter_mut().zip(ranges) {
                *value = if max > min { (*value - min) / (max - min) } else { 0.0 };
            }
        }
        for layer in &self.layers {
            x = layer.forward(&x);
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(ClassifierError::Inference("non-finite output".to_string()));
        }

        let mut ranked: Vec<Classification> = self
            .labels
            .iter()
            .zip(x.iter())
            .map(|(label, &confidence)| Classification {
                label: label.clone(),
                confidence,
            })
            .collect();
        ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        Ok(ranked)
    }
}

#[async_trait]
impl Classifier for DenseClassifier {
    async fn classify(&self, input: &[f32]) -> Result<Vec<Classification>, ClassifierError> {
        self.predict(input)
    }
}

fn build_layers(model: ModelJson, weights: &[u8]) -> Result<Vec<DenseLayer>, ClassifierError> {
    let layer_specs = match model.model_topology.config {
        TopologyConfigJson::Sequential { layers } | TopologyConfigJson::Bare(layers) => layers,
    };
    let mut tensors = model
        .weights_manifest
        .into_iter()
        .flat_map(|group| group.weights)
        .collect::<Vec<_>>()
        .into_iter();

    if weights.len() % 4 != 0 {
        return Err(ClassifierError::Shape(format!(
            "weights blob length {} is not a multiple of 4",
            weights.len()
        )));
    }
    let floats: Vec<f32> = weights
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    let mut offset = 0usize;

    let mut layers = Vec::new();
    for layer in layer_specs {
        if layer.class_name != "Dense" {
            // InputLayer, Dropout and friends carry no weights used at inference.
            continue;
        }
        let units = layer.config.get("units").and_then(Value::as_u64).unwrap_or(0) as usize;
        let activation = Activation::parse(
            layer
                .config
                .get("activation")
                .and_then(Value::as_str)
                .unwrap_or("linear"),
        )?;
        let use_bias = layer.config.get("use_bias").and_then(Value::as_bool).unwrap_or(true);

        let spec = tensors
            .next()
            .ok_or_else(|| ClassifierError::Shape("manifest is missing a kernel".to_string()))?;
        let (shape, data) = take_tensor(&floats, &mut offset, spec)?;
        let &[inputs, cols] = shape.as_slice() else {
            return Err(ClassifierError::Shape(format!("kernel shape {:?} is not 2D", shape)));
        };
        if cols != units {
            return Err(ClassifierError::Shape(format!("kernel has {} units, layer declares {}", cols, units)));
        }
        let kernel = DMatrix::from_row_slice(inputs, cols, data);

        let bias = if use_bias {
            let spec = tensors
                .next()
                .ok_or_else(|| ClassifierError::Shape("manifest is missing a bias".to_string()))?;
            let (shape, data) = take_tensor(&floats, &mut offset, spec)?;
            if shape != [units] {
                return Err(ClassifierError::Shape(format!("bias shape {:?} does not match {} units", shape, units)));
            }
            Some(DVector::from_column_slice(data))
        } else {
            None
        };

        if let Some(prev) = layers.last().map(|l: &DenseLayer| l.kernel.ncols()) {
            if prev != inputs {
                return Err(ClassifierError::Shape(format!(
                    "layer expects {} inputs but previous layer has {} units",
                    inputs, prev
                )));
            }
        }
        layers.push(DenseLayer {
            kernel,
            bias,
            activation,
        });
    }
    Ok(layers)
}

fn take_tensor<'a>(
    floats: &'a [f32],
    offset: &mut usize,
    spec: WeightSpecJson,
) -> Result<(Vec<usize>, &'a [f32]), ClassifierError> {
    if spec.dtype != "float32" {
        return Err(ClassifierError::Shape(format!("{} has dtype {}", spec.name, spec.dtype)));
    }
    let overflow = || ClassifierError::Shape(format!("{} shape {:?} is too large", spec.name, spec.shape));
    let len = spec
        .shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(overflow)?;
    let end = offset.checked_add(len).ok_or_else(overflow)?;
    let Some(slice) = floats.get(*offset..end) else {
        return Err(ClassifierError::Shape(format!("weights blob too short for {}", spec.name)));
    };
    *offset = end;
    Ok((spec.shape, slice))
}

fn output_labels(outputs: &serde_json::Map<String, Value>, units: usize) -> Vec<String> {
    let unique = outputs
        .get("label")
        .or_else(|| outputs.values().next())
        .and_then(|o| o.get("uniqueValues"))
        .and_then(Value::as_array);

    let mut labels: Vec<String> = unique
        .map(|values| {
            values
                .iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    labels.truncate(units);
    while labels.len() < units {
        labels.push(format!("class_{}", labels.len()));
    }
    labels
}

/// Orders inputs by the number their name ends in (`"0"`, `"input3"`, ...).
fn input_ranges(inputs: &serde_json::Map<String, Value>, expected: usize) -> Result<Vec<(f32, f32)>, ClassifierError> {
    let mut ranges: Vec<(usize, (f32, f32))> = Vec::with_capacity(inputs.len());
    for (name, spec) in inputs {
        let digits: String = name
            .chars()
            .rev()
            .take_while(char::is_ascii_digit)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        let index = digits
            .parse::<usize>()
            .map_err(|_| ClassifierError::Shape(format!("input {name} has no index")))?;
        let min = spec.get("min").and_then(Value::as_f64).unwrap_or(0.0) as f32;
        let max = spec.get("max").and_then(Value::as_f64).unwrap_or(1.0) as f32;
        ranges.push((index, (min, max)));
    }
    if ranges.len() != expected {
        return Err(ClassifierError::Shape(format!(
            "metadata normalizes {} inputs, expected {}",
            ranges.len(),
            expected
        )));
    }
    ranges.sort_by_key(|(index, _)| *index);
    Ok(ranges.into_iter().map(|(_, range)| range).collect())
}

/// Loads the three model assets from URLs or the local filesystem.
#[derive(Debug, Clone, Default)]
pub struct RemoteModelLoader {
    client: reqwest::Client,
}

impl RemoteModelLoader {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fetch(&self, location: &str) -> Result<Vec<u8>, ClassifierError> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let fetch_err = |e: reqwest::Error| ClassifierError::Fetch {
                location: location.to_string(),
                message: e.to_string(),
            };
            let response = self
                .client
                .get(location)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(fetch_err)?;
            Ok(response.bytes().await.map_err(fetch_err)?.to_vec())
        } else {
            tokio::fs::read(location).await.map_err(|source| ClassifierError::Io {
                location: location.to_string(),
                source,
            })
        }
    }
}

#[async_trait]
impl ClassifierLoader for RemoteModelLoader {
    async fn load(
        &self,
        options: &ClassifierOptions,
        source: &ModelSource,
    ) -> Result<Arc<dyn Classifier>, ClassifierError> {
        let (model, metadata, weights) = tokio::try_join!(
            self.fetch(&source.model),
            self.fetch(&source.metadata),
            self.fetch(&source.weights),
        )?;
        let classifier = DenseClassifier::from_parts(&model, &metadata, &weights, options)?;
        info!(labels = ?classifier.labels(), "dense pose classifier built");
        Ok(Arc::new(classifier))
    }
}
