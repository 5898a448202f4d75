use serde::{Deserialize, Serialize};

/// Precision features a model needs from the accelerator.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Precision {
    #[serde(default)]
    pub fp16: bool,
    #[serde(default)]
    pub bf16: bool,
}

/// Resource contract for one request. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelRequirement {
    pub model_name: String,
    pub estimated_memory_mb: u64,
    #[serde(default)]
    pub precision: Precision,
}

impl ModelRequirement {
    /// Requirement derived from the built-in profile table.
    pub fn for_model(model_name: &str) -> Self {
        let model_name = normalize_model_name(model_name);
        let profile = lookup_profile(&model_name);
        Self {
            model_name,
            estimated_memory_mb: profile.memory_mb,
            precision: profile.precision,
        }
    }

    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.estimated_memory_mb = memory_mb;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProfile {
    pub memory_mb: u64,
    pub precision: Precision,
}

const QUANTIZED: Precision = Precision {
    fp16: false,
    bf16: false,
};

/// Profile used for names nothing else matches. Sized for a mid-range model so
/// small accelerators are not handed something they cannot hold.
pub const DEFAULT_PROFILE: ModelProfile = ModelProfile {
    memory_mb: 8_192,
    precision: QUANTIZED,
};

/// Known model families at their default (4-bit) quantization, keyed by
/// `family:parameters`.
const KNOWN_MODELS: &[(&str, u64)] = &[
    ("llama3:8b", 5_120),
    ("llama3:70b", 41_984),
    ("llama3.1:8b", 5_120),
    ("llama3.1:70b", 41_984),
    ("llama3.1:405b", 235_520),
    ("llama3.2:1b", 1_434),
    ("llama3.2:3b", 2_150),
    ("llama2:7b", 4_096),
    ("llama2:13b", 7_680),
    ("llama2:70b", 39_936),
    ("codellama:7b", 4_096),
    ("codellama:13b", 7_680),
    ("codellama:34b", 19_456),
    ("codellama:70b", 39_936),
    ("mistral:7b", 4_403),
    ("mixtral:8x7b", 26_624),
    ("mixtral:8x22b", 81_920),
    ("qwen2.5:0.5b", 409),
    ("qwen2.5:1.5b", 1_024),
    ("qwen2.5:7b", 4_812),
    ("qwen2.5:14b", 9_216),
    ("qwen2.5:32b", 20_480),
    ("qwen2.5:72b", 48_128),
    ("qwen2.5-coder:7b", 4_812),
    ("qwen2.5-coder:32b", 20_480),
    ("deepseek-coder-v2:16b", 9_113),
    ("deepseek-r1:7b", 4_812),
    ("deepseek-r1:70b", 43_008),
    ("gemma2:2b", 1_638),
    ("gemma2:9b", 5_529),
    ("gemma2:27b", 16_384),
    ("phi3:3.8b", 2_253),
    ("phi3:14b", 8_090),
    ("nomic-embed-text:latest", 280),
];

/// Tags that carry no parameter count resolve to the family's usual size.
const FAMILY_DEFAULTS: &[(&str, &str)] = &[
    ("llama3", "8b"),
    ("llama3.1", "8b"),
    ("llama3.2", "3b"),
    ("llama2", "7b"),
    ("codellama", "7b"),
    ("mistral", "7b"),
    ("mixtral", "8x7b"),
    ("qwen2.5", "7b"),
    ("qwen2.5-coder", "7b"),
    ("deepseek-coder-v2", "16b"),
    ("deepseek-r1", "7b"),
    ("gemma2", "9b"),
    ("phi3", "3.8b"),
];

/// Unknown families: memory by parameter count, in billions (upper bound, MiB).
const PARAMETER_CLASSES: &[(f64, u64)] = &[
    (1.0, 1_536),
    (4.0, 3_072),
    (9.0, 6_144),
    (15.0, 10_240),
    (35.0, 21_504),
    (75.0, 46_080),
];

/// Memory multiplier for explicit quantization suffixes, relative to 4-bit.
const QUANT_FACTORS: &[(&str, f64, Precision)] = &[
    ("q4", 1.0, QUANTIZED),
    ("q5", 1.25, QUANTIZED),
    ("q6", 1.5, QUANTIZED),
    ("q8", 1.9, QUANTIZED),
    ("fp16", 3.6, Precision { fp16: true, bf16: false }),
    ("bf16", 3.6, Precision { fp16: false, bf16: true }),
];

/// `llama3` → `llama3:latest`; names are matched case-insensitively.
pub fn normalize_model_name(name: &str) -> String {
    let name = name.trim().to_ascii_lowercase();
    if name.contains(':') {
        name
    } else {
        format!("{name}:latest")
    }
}

/// Resolve a normalized `family:tag` name to its resource profile.
pub fn lookup_profile(model_name: &str) -> ModelProfile {
    let normalized = normalize_model_name(model_name);
    let (family, tag) = normalized
        .split_once(':')
        .unwrap_or((normalized.as_str(), "latest"));

    // Tags look like "8b", "8b-instruct-q8_0" or "latest".
    let mut parts = tag.split('-');
    let size = parts.next().unwrap_or("latest");
    let quant = tag
        .split('-')
        .find_map(|p| QUANT_FACTORS.iter().find(|(q, _, _)| p.starts_with(q)));

    let size = if size == "latest" || !is_parameter_tag(size) {
        FAMILY_DEFAULTS
            .iter()
            .find(|(f, _)| *f == family)
            .map(|(_, s)| *s)
            .unwrap_or(size)
    } else {
        size
    };

    let key = format!("{family}:{size}");
    let base_mb = KNOWN_MODELS
        .iter()
        .find(|(k, _)| *k == key || *k == normalized)
        .map(|(_, mb)| *mb)
        .or_else(|| parameter_billions(size).map(memory_for_parameters));

    let Some(base_mb) = base_mb else {
        return DEFAULT_PROFILE;
    };

    match quant {
        Some((_, factor, precision)) => ModelProfile {
            memory_mb: (base_mb as f64 * factor).ceil() as u64,
            precision: *precision,
        },
        None => ModelProfile {
            memory_mb: base_mb,
            precision: QUANTIZED,
        },
    }
}

fn is_parameter_tag(tag: &str) -> bool {
    parameter_billions(tag).is_some()
}

/// Largest parameter count (billions) taken at face value.
const MAX_PARAMETER_BILLIONS: f64 = 10_000.0;

/// "8b" → 8.0, "3.8b" → 3.8, "8x7b" → 56.0, "270m" → 0.27.
fn parameter_billions(tag: &str) -> Option<f64> {
    let billions = if let Some(rest) = tag.strip_suffix('b') {
        match rest.split_once('x') {
            Some((experts, each)) => experts.parse::<f64>().ok()? * each.parse::<f64>().ok()?,
            None => rest.parse::<f64>().ok()?,
        }
    } else {
        tag.strip_suffix('m')?.parse::<f64>().ok()? / 1000.0
    };
    Some(billions).filter(|b| b.is_finite() && *b > 0.0 && *b < MAX_PARAMETER_BILLIONS)
}

fn memory_for_parameters(billions: f64) -> u64 {
    PARAMETER_CLASSES
        .iter()
        .find(|(max, _)| billions <= *max)
        .map(|(_, mb)| *mb)
        // ~0.6 GiB per billion parameters at 4-bit, plus runtime overhead.
        .unwrap_or_else(|| ((billions * 620.0).ceil() as u64).saturating_add(1_024))
}

/// Model names accepted by the backend: `family[:tag]` with an optional namespace.
pub fn validate_model_name(name: &str) -> Result<(), String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err("model name must not be empty".to_string());
    }
    if trimmed.len() > 256 {
        return Err("model name too long".to_string());
    }
    let ok = trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | ':' | '/'));
    if !ok {
        return Err(format!("model name '{trimmed}' contains invalid characters"));
    }
    if trimmed.matches(':').count() > 1 {
        return Err(format!("model name '{trimmed}' has more than one tag separator"));
    }
    Ok(())
}
