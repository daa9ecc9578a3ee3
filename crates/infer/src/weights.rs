use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail, ensure};
use candle_core::{DType, Device, Tensor};
use memmap2::MmapOptions;
use safetensors::{Dtype, SafeTensors, tensor::TensorView};
use serde::Deserialize;
use tracing::{debug, info};

use docvl_core::benchmark::Timer;

const INDEX_FILE: &str = "model.safetensors.index.json";
const SINGLE_FILE: &str = "model.safetensors";

#[derive(Debug, Deserialize)]
struct ShardIndex {
    weight_map: HashMap<String, String>,
}

/// Resolve the safetensors files behind `path`.
///
/// A file is used as-is. A directory is searched for a shard index, then `model.safetensors`,
/// then every `*.safetensors` file in name order.
pub fn resolve_weight_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    ensure!(
        path.is_dir(),
        "weights path {} does not exist",
        path.display()
    );

    let index_path = path.join(INDEX_FILE);
    if index_path.is_file() {
        let raw = fs::read_to_string(&index_path)
            .with_context(|| format!("failed to read {}", index_path.display()))?;
        let index: ShardIndex = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", index_path.display()))?;
        let shards: BTreeSet<&String> = index.weight_map.values().collect();
        ensure!(
            !shards.is_empty(),
            "{} lists no weight shards",
            index_path.display()
        );
        return Ok(shards.into_iter().map(|shard| path.join(shard)).collect());
    }

    let single = path.join(SINGLE_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .with_context(|| format!("failed to list {}", path.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext == "safetensors"))
        .collect();
    files.sort();
    ensure!(
        !files.is_empty(),
        "no safetensors files found in {}",
        path.display()
    );
    Ok(files)
}

/// Memory-map each shard and copy every tensor onto the CPU under its stored name.
pub fn load_weight_map(files: &[PathBuf]) -> Result<HashMap<String, Tensor>> {
    let timer = Timer::new("weights.load");
    let mut tensors = HashMap::new();
    for file_path in files {
        let file = File::open(file_path)
            .with_context(|| format!("failed to open weights file {}", file_path.display()))?;
        // SAFETY: the mapping is read-only and dropped before this function returns.
        let mmap = unsafe { MmapOptions::new().map(&file) }
            .with_context(|| format!("failed to mmap {}", file_path.display()))?;
        let parsed = SafeTensors::deserialize(&mmap)
            .with_context(|| format!("failed to parse safetensors {}", file_path.display()))?;
        for (name, view) in parsed.tensors() {
            let tensor = view_to_tensor(&view)
                .with_context(|| format!("failed to load tensor {name}"))?;
            if tensors.insert(name.clone(), tensor).is_some() {
                bail!("tensor {name} appears in more than one shard");
            }
        }
        debug!(path = %file_path.display(), "loaded weight shard");
    }
    let count = tensors.len();
    timer.finish(|event| {
        event.add_field("shards", files.len());
        event.add_field("tensors", count);
    });
    Ok(tensors)
}

fn view_to_tensor(view: &TensorView<'_>) -> Result<Tensor> {
    let dtype = match view.dtype() {
        Dtype::U8 => DType::U8,
        Dtype::U32 => DType::U32,
        Dtype::I64 => DType::I64,
        Dtype::BF16 => DType::BF16,
        Dtype::F16 => DType::F16,
        Dtype::F32 => DType::F32,
        Dtype::F64 => DType::F64,
        other => bail!("unsupported safetensors dtype {other:?}"),
    };
    Ok(Tensor::from_raw_buffer(
        view.data(),
        dtype,
        view.shape(),
        &Device::Cpu,
    )?)
}

type Predicate = fn(&str, &Tensor) -> bool;
type Transform = fn(String, Tensor) -> Result<Option<(String, Tensor)>>;

/// One checkpoint normalisation step. Returning `None` from `apply` drops the tensor.
struct SanitizeRule {
    name: &'static str,
    applies: Predicate,
    apply: Transform,
}

const VISION_PREFIXES: &[&str] = &[
    "visual.vision_model.",
    "model.vision_model.",
    "model.vision_tower.",
    "vision_model.",
];

const LANGUAGE_PREFIXES: &[(&str, &str)] = &[
    ("language_model.model.", "model."),
    ("language_model.lm_head.", "lm_head."),
    ("mlp_AR.", "multi_modal_projector."),
    ("mm_projector.", "multi_modal_projector."),
];

const RULES: &[SanitizeRule] = &[
    SanitizeRule {
        name: "vision prefix",
        applies: |name, _| VISION_PREFIXES.iter().any(|p| name.starts_with(p)),
        apply: |name, tensor| {
            let renamed = VISION_PREFIXES
                .iter()
                .find_map(|p| name.strip_prefix(p))
                .map(|rest| format!("vision_tower.{rest}"))
                .unwrap_or(name);
            Ok(Some((renamed, tensor)))
        },
    },
    SanitizeRule {
        name: "language prefix",
        applies: |name, _| LANGUAGE_PREFIXES.iter().any(|(p, _)| name.starts_with(p)),
        apply: |name, tensor| {
            let renamed = LANGUAGE_PREFIXES
                .iter()
                .find_map(|(p, to)| name.strip_prefix(p).map(|rest| format!("{to}{rest}")))
                .unwrap_or(name);
            Ok(Some((renamed, tensor)))
        },
    },
    SanitizeRule {
        name: "rotary buffers",
        applies: |name, _| name.ends_with("rotary_emb.inv_freq"),
        apply: |_, _| Ok(None),
    },
    SanitizeRule {
        name: "channel-last conv",
        applies: |_, tensor| {
            matches!(tensor.dims(), &[_, c, k1, k2] if k1 == k2 && c != k1)
        },
        apply: |name, tensor| {
            let permuted = tensor.permute((0, 2, 3, 1))?.contiguous()?;
            Ok(Some((name, permuted)))
        },
    },
];

/// Normalise checkpoint names and layouts.
///
/// Rules run in order over every tensor, once per load; the result uses the `vision_tower.`,
/// `multi_modal_projector.`, `model.` and `lm_head.` names with channel-last patch kernels.
pub fn sanitize_weights(weights: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut hits = vec![0usize; RULES.len()];
    let mut sanitized = HashMap::with_capacity(weights.len());
    'tensors: for (name, tensor) in weights {
        let mut entry = (name, tensor);
        for (idx, rule) in RULES.iter().enumerate() {
            if !(rule.applies)(&entry.0, &entry.1) {
                continue;
            }
            hits[idx] += 1;
            let original = entry.0.clone();
            match (rule.apply)(entry.0, entry.1)
                .with_context(|| format!("{} rule failed on {original}", rule.name))?
            {
                Some(next) => entry = next,
                None => continue 'tensors,
            }
        }
        let (name, tensor) = entry;
        ensure!(
            !sanitized.contains_key(&name),
            "tensor {name} is produced by more than one checkpoint entry"
        );
        sanitized.insert(name, tensor);
    }
    for (rule, count) in RULES.iter().zip(&hits) {
        if *count > 0 {
            debug!(rule = rule.name, tensors = count, "sanitized weights");
        }
    }
    Ok(sanitized)
}

/// Resolve, load and sanitize a checkpoint in one go.
pub fn load_sanitized_weights(path: &Path) -> Result<HashMap<String, Tensor>> {
    let files = resolve_weight_files(path)?;
    info!(
        path = %path.display(),
        shards = files.len(),
        "loading safetensors weights"
    );
    sanitize_weights(load_weight_map(&files)?)
}
