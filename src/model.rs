//! Inference network loading and execution.
//!
//! A model ships as two files, the same split the sessions receive from the
//! integrator: a JSON parameter descriptor naming the dense-layer topology,
//! and a raw little-endian f32 weight blob holding, per layer, the row-major
//! weight matrix followed by the bias vector. The blob length is validated
//! exactly against the descriptor before any tensor is built; a loaded
//! `Network` is immutable, deterministic, and runs on one dedicated thread.
//!
//! Descriptor example:
//!
//! ```json
//! { "name": "detector", "input": 512,
//!   "layers": [ { "output": 1, "activation": "sigmoid" } ] }
//! ```

use crate::diag;
use crate::error::ModelError;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind};
use std::path::Path;

/// Per-layer activation function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
}

/// One dense layer in the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerSpec {
    pub output: usize,
    pub activation: Activation,
}

/// Parsed parameter descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSpec {
    #[serde(default)]
    pub name: Option<String>,
    /// Input width; the pipeline feeds one frame of samples.
    pub input: usize,
    pub layers: Vec<LayerSpec>,
}

impl NetworkSpec {
    /// Exact number of f32 values the weight blob must contain.
    pub fn weight_count(&self) -> usize {
        let mut input = self.input;
        let mut total = 0usize;
        for layer in &self.layers {
            total += input * layer.output + layer.output;
            input = layer.output;
        }
        total
    }

    pub fn output_width(&self) -> usize {
        self.layers.last().map(|l| l.output).unwrap_or(self.input)
    }

    fn validate(&self) -> Result<(), ModelError> {
        if self.input == 0 {
            return Err(ModelError::Malformed("input width must be > 0".to_string()));
        }
        if self.layers.is_empty() {
            return Err(ModelError::Malformed(
                "descriptor declares no layers".to_string(),
            ));
        }
        if self.layers.iter().any(|l| l.output == 0) {
            return Err(ModelError::Malformed(
                "layer output width must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct DenseLayer {
    weight: Tensor,
    bias: Tensor,
    activation: Activation,
}

/// A loaded, immutable inference network.
#[derive(Debug)]
pub struct Network {
    spec: NetworkSpec,
    layers: Vec<DenseLayer>,
    device: Device,
}

impl Network {
    /// Load a descriptor + weight blob pair from disk. Synchronous and
    /// possibly slow; call during session setup, never on an audio thread.
    pub fn load(param_path: &Path, weight_path: &Path) -> Result<Self, ModelError> {
        let descriptor = std::fs::read_to_string(param_path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                ModelError::FileMissing(param_path.display().to_string())
            } else {
                ModelError::Malformed(format!("{}: {err}", param_path.display()))
            }
        })?;
        let spec: NetworkSpec = serde_json::from_str(&descriptor)
            .map_err(|err| ModelError::Malformed(err.to_string()))?;
        spec.validate()?;

        let weights = read_weight_blob(weight_path)?;
        let expected = spec.weight_count();
        if weights.len() != expected {
            return Err(ModelError::SizeMismatch {
                expected,
                actual: weights.len(),
            });
        }

        let device = Device::Cpu;
        let mut layers = Vec::with_capacity(spec.layers.len());
        let mut offset = 0usize;
        let mut input = spec.input;
        for layer in &spec.layers {
            let weight_len = input * layer.output;
            let weight = Tensor::from_vec(
                weights[offset..offset + weight_len].to_vec(),
                (input, layer.output),
                &device,
            )
            .map_err(backend_err)?;
            offset += weight_len;
            let bias = Tensor::from_vec(
                weights[offset..offset + layer.output].to_vec(),
                (1, layer.output),
                &device,
            )
            .map_err(backend_err)?;
            offset += layer.output;
            layers.push(DenseLayer {
                weight,
                bias,
                activation: layer.activation,
            });
            input = layer.output;
        }

        diag::model_loaded();
        Ok(Self {
            spec,
            layers,
            device,
        })
    }

    pub fn name(&self) -> Option<&str> {
        self.spec.name.as_deref()
    }

    pub fn input_width(&self) -> usize {
        self.spec.input
    }

    pub fn output_width(&self) -> usize {
        self.spec.output_width()
    }

    /// Run the forward pass for one frame of samples.
    pub fn infer(&self, input: &[f32]) -> Result<Vec<f32>, ModelError> {
        if input.len() != self.spec.input {
            return Err(ModelError::InputMismatch {
                expected: self.spec.input,
                actual: input.len(),
            });
        }
        let mut x = Tensor::from_vec(input.to_vec(), (1, input.len()), &self.device)
            .map_err(backend_err)?;
        for layer in &self.layers {
            x = x
                .matmul(&layer.weight)
                .and_then(|t| t.broadcast_add(&layer.bias))
                .map_err(backend_err)?;
            x = match layer.activation {
                Activation::Linear => x,
                Activation::Relu => x.relu().map_err(backend_err)?,
                Activation::Tanh => x.tanh().map_err(backend_err)?,
                Activation::Sigmoid => candle_nn::ops::sigmoid(&x).map_err(backend_err)?,
            };
        }
        let rows = x.to_vec2::<f32>().map_err(backend_err)?;
        Ok(rows.into_iter().next().unwrap_or_default())
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        diag::model_dropped();
    }
}

fn backend_err(err: candle_core::Error) -> ModelError {
    ModelError::Backend(err.to_string())
}

fn read_weight_blob(path: &Path) -> Result<Vec<f32>, ModelError> {
    let file = File::open(path).map_err(|err| {
        if err.kind() == ErrorKind::NotFound {
            ModelError::FileMissing(path.display().to_string())
        } else {
            ModelError::Malformed(format!("{}: {err}", path.display()))
        }
    })?;
    let byte_len = file
        .metadata()
        .map_err(|err| ModelError::Malformed(err.to_string()))?
        .len();
    if byte_len % 4 != 0 {
        return Err(ModelError::Malformed(format!(
            "weight blob length {byte_len} is not a multiple of 4"
        )));
    }
    let count = (byte_len / 4) as usize;
    let mut reader = BufReader::new(file);
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(
            reader
                .read_f32::<LittleEndian>()
                .map_err(|err| ModelError::Malformed(err.to_string()))?,
        );
    }
    Ok(out)
}

/// Serialize a descriptor + weight blob pair. Tooling/self-test counterpart
/// of [`Network::load`].
pub fn write_network(
    param_path: &Path,
    weight_path: &Path,
    spec: &NetworkSpec,
    weights: &[f32],
) -> Result<(), ModelError> {
    spec.validate()?;
    let expected = spec.weight_count();
    if weights.len() != expected {
        return Err(ModelError::SizeMismatch {
            expected,
            actual: weights.len(),
        });
    }
    let descriptor = serde_json::to_string_pretty(spec)
        .map_err(|err| ModelError::Malformed(err.to_string()))?;
    std::fs::write(param_path, descriptor)
        .map_err(|err| ModelError::Malformed(format!("{}: {err}", param_path.display())))?;
    let file = File::create(weight_path)
        .map_err(|err| ModelError::Malformed(format!("{}: {err}", weight_path.display())))?;
    let mut writer = BufWriter::new(file);
    for value in weights {
        writer
            .write_f32::<LittleEndian>(*value)
            .map_err(|err| ModelError::Malformed(err.to_string()))?;
    }
    Ok(())
}
