//! What the supervisor runs: program, working directory, arguments, and the
//! output locations a successful run produces.
//!
//! The supervisor treats an [`Invocation`] as opaque. The builders here turn
//! validated job parameters into `sd-cli` command lines.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for job parameters that cannot become an invocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvocationError {
    /// A required parameter is missing or empty.
    #[error("{0} is required")]
    Missing(&'static str),

    /// A numeric parameter is outside its accepted range.
    #[error("{name} must be at least {min}, got {value}")]
    OutOfRange {
        name: &'static str,
        min: i64,
        value: i64,
    },

    /// A relative path tried to escape its base directory.
    #[error("invalid {name}: {value:?}")]
    InvalidPath { name: &'static str, value: String },
}

/// A fully resolved command for the wrapped binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub working_dir: PathBuf,
    pub args: Vec<String>,
    /// Locations reported as the job result on success.
    pub outputs: Vec<String>,
}

impl Invocation {
    /// The command line as a shell-ish string for logs.
    pub fn printable(&self) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.args.iter().map(|arg| {
                if arg.contains(' ') {
                    format!("\"{}\"", arg.replace('"', "\\\""))
                } else {
                    arg.clone()
                }
            }))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Where to find the binary and the directories it reads and writes.
#[derive(Debug, Clone)]
pub struct BinaryLocation {
    pub program: PathBuf,
    pub working_dir: PathBuf,
}

/// Locate `sd-cli`.
///
/// Prefers `<root>/bin/sd-cli`, then `<root>/sd-cli` (symlinks resolved,
/// run from the binary's directory), and falls back to `sd` on `PATH` run
/// from the current directory.
pub fn resolve_binary(root: &Path) -> BinaryLocation {
    for candidate in [root.join("bin").join("sd-cli"), root.join("sd-cli")] {
        if !candidate.is_file() {
            continue;
        }
        let program = candidate.canonicalize().unwrap_or(candidate);
        let working_dir = program
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        return BinaryLocation {
            program,
            working_dir,
        };
    }

    BinaryLocation {
        program: PathBuf::from("sd"),
        working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

/// Join a caller-supplied relative name onto `base`, refusing anything that
/// would land outside it.
fn join_under(base: &Path, name: &'static str, value: &str) -> Result<PathBuf, InvocationError> {
    let rel = Path::new(value);
    let escapes = rel.is_absolute()
        || rel
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if escapes {
        return Err(InvocationError::InvalidPath {
            name,
            value: value.to_string(),
        });
    }
    Ok(base.join(rel))
}

fn required<'a>(name: &'static str, value: &'a str) -> Result<&'a str, InvocationError> {
    let value = value.trim();
    if value.is_empty() {
        Err(InvocationError::Missing(name))
    } else {
        Ok(value)
    }
}

fn at_least(name: &'static str, value: i64, min: i64) -> Result<i64, InvocationError> {
    if value < min {
        Err(InvocationError::OutOfRange { name, min, value })
    } else {
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Convert
// ---------------------------------------------------------------------------

/// Parameters for a weight conversion job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertParams {
    /// Source model, relative to the models directory.
    pub model: String,
    /// Output file name, relative to the models directory.
    pub output: String,
    /// Target weight type, e.g. `q8_0`.
    #[serde(rename = "type")]
    pub quant_type: String,
}

impl ConvertParams {
    pub fn build(
        &self,
        binary: &BinaryLocation,
        models_dir: &Path,
    ) -> Result<Invocation, InvocationError> {
        let model = join_under(models_dir, "model", required("model", &self.model)?)?;
        let output = join_under(models_dir, "output", required("output", &self.output)?)?;
        let quant_type = required("type", &self.quant_type)?;

        let output = output.display().to_string();
        let args = vec![
            "-M".to_string(),
            "convert".to_string(),
            "-m".to_string(),
            model.display().to_string(),
            "--type".to_string(),
            quant_type.to_string(),
            "-o".to_string(),
            output.clone(),
            "--verbose".to_string(),
        ];

        Ok(Invocation {
            program: binary.program.clone(),
            working_dir: binary.working_dir.clone(),
            args,
            outputs: vec![output],
        })
    }
}

// ---------------------------------------------------------------------------
// Generate
// ---------------------------------------------------------------------------

/// Parameters for a text-to-image job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GenerateParams {
    /// Checkpoint, relative to the models directory.
    pub model: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub sampling_method: Option<String>,
    /// Number of images; values below 2 produce a single image.
    pub batch_count: Option<i64>,
    pub verbose: bool,
}

/// File stem derived from the job's creation time, e.g. `20250301-142233`.
pub fn output_stem(created_at: DateTime<Utc>) -> String {
    created_at
        .with_timezone(&Local)
        .format("%Y%m%d-%H%M%S")
        .to_string()
}

impl GenerateParams {
    /// Build the command line. Images are written to
    /// `<output_dir>/txt2img/<stem>.png` and reported as
    /// `/output/txt2img/<stem>.png`.
    pub fn build(
        &self,
        binary: &BinaryLocation,
        models_dir: &Path,
        output_dir: &Path,
        created_at: DateTime<Utc>,
    ) -> Result<Invocation, InvocationError> {
        let model = join_under(models_dir, "model", required("model", &self.model)?)?;
        let prompt = required("prompt", &self.prompt)?;

        let mut args = vec![
            "-m".to_string(),
            model.display().to_string(),
            "-p".to_string(),
            prompt.to_string(),
        ];

        if let Some(negative) = self.negative_prompt.as_deref().map(str::trim) {
            if !negative.is_empty() {
                args.extend(["-n".to_string(), negative.to_string()]);
            }
        }
        if let Some(method) = self.sampling_method.as_deref().filter(|m| !m.is_empty()) {
            args.extend(["--sampling-method".to_string(), method.to_string()]);
        }
        if let Some(cfg) = self.cfg_scale {
            if cfg.is_nan() || cfg < 1.0 {
                return Err(InvocationError::OutOfRange {
                    name: "cfgScale",
                    min: 1,
                    value: cfg as i64,
                });
            }
            args.extend(["--cfg-scale".to_string(), cfg.to_string()]);
        }
        if let Some(width) = self.width {
            args.extend(["-W".to_string(), at_least("width", width, 64)?.to_string()]);
        }
        if let Some(height) = self.height {
            args.extend(["-H".to_string(), at_least("height", height, 64)?.to_string()]);
        }
        if let Some(steps) = self.steps {
            args.extend(["--steps".to_string(), at_least("steps", steps, 1)?.to_string()]);
        }
        if let Some(seed) = self.seed {
            args.extend(["-s".to_string(), at_least("seed", seed, -1)?.to_string()]);
        }

        let stem = output_stem(created_at);
        let target = output_dir.join("txt2img").join(format!("{stem}.png"));
        args.extend(["-o".to_string(), target.display().to_string()]);

        let batch = self.batch_count.filter(|n| *n >= 2);
        if let Some(n) = batch {
            args.extend(["--batch-count".to_string(), n.to_string()]);
        }
        if self.verbose {
            args.push("--verbose".to_string());
        }

        let mut outputs = vec![format!("/output/txt2img/{stem}.png")];
        for i in 2..=batch.unwrap_or(1) {
            outputs.push(format!("/output/txt2img/{stem}_{i}.png"));
        }

        Ok(Invocation {
            program: binary.program.clone(),
            working_dir: binary.working_dir.clone(),
            args,
            outputs,
        })
    }
}
