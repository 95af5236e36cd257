//! GGUF header introspection and config guessing.
//!
//! Parses just the metadata table of a GGUF v2/v3 file (magic, kv pairs)
//! without touching tensor data, then fills unset config fields: context
//! size, GPU offload split, model name and a prompt template preset picked
//! by model family.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use super::{ModelConfig, TemplateConfig};

/// Strings longer than this are skipped while scanning the kv table,
/// except the chat template which is read in full.
const MAX_INLINE_STRING: u64 = 1 << 20;

/// Layer count stand-in for "offload everything".
pub const ALL_GPU_LAYERS: i32 = 99999999;

const DEFAULT_CONTEXT_SIZE: i32 = 1024;

/// Metadata extracted from a GGUF header.
#[derive(Debug, Clone, Default)]
pub struct GgufMetadata {
    pub architecture: String,
    pub name: String,
    pub context_length: Option<u32>,
    pub block_count: Option<u32>,
    pub eos_token_id: Option<u32>,
    pub bos_token_id: Option<u32>,
    pub chat_template: String,
    pub file_size: u64,
}

/// Well-known model families with template presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFamily {
    LLaMa3,
    CommandR,
    Phi3,
    ChatML,
    Mistral03,
    Gemma,
    DeepSeek2,
    Unknown,
}

/// Parse the metadata table of a GGUF file. Returns `None` for anything
/// that is not a GGUF v2+ file; the guesser treats that as "not a model
/// binary we understand" and leaves the config alone.
pub fn parse_gguf_header(path: &Path) -> Option<GgufMetadata> {
    let file = File::open(path).ok()?;
    let file_size = file.metadata().ok()?.len();
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).ok()?;
    if &magic != b"GGUF" {
        return None;
    }

    let version = read_u32(&mut r)?;
    if version < 2 {
        return None;
    }

    let _tensor_count = read_u64(&mut r)?;
    let kv_count = read_u64(&mut r)?;

    let mut meta = GgufMetadata {
        file_size,
        ..Default::default()
    };

    for _ in 0..kv_count {
        let key = read_string(&mut r, MAX_INLINE_STRING)?;
        let vtype = read_u32(&mut r)?;

        match key.as_str() {
            "general.architecture" if vtype == 8 => {
                meta.architecture = read_string(&mut r, MAX_INLINE_STRING)?;
            }
            "general.name" if vtype == 8 => {
                meta.name = read_string(&mut r, MAX_INLINE_STRING)?;
            }
            "tokenizer.chat_template" if vtype == 8 => {
                meta.chat_template = read_string(&mut r, MAX_INLINE_STRING)?;
            }
            "tokenizer.ggml.eos_token_id" if vtype == 4 || vtype == 5 => {
                meta.eos_token_id = Some(read_u32(&mut r)?);
            }
            "tokenizer.ggml.bos_token_id" if vtype == 4 || vtype == 5 => {
                meta.bos_token_id = Some(read_u32(&mut r)?);
            }
            _ => {
                // Architecture-scoped numeric fields need the architecture
                // read first; GGUF writers emit it as the first key.
                if (vtype == 4 || vtype == 5) && !meta.architecture.is_empty() {
                    let value = read_u32(&mut r)?;
                    if key == format!("{}.context_length", meta.architecture) {
                        meta.context_length = Some(value);
                    } else if key == format!("{}.block_count", meta.architecture) {
                        meta.block_count = Some(value);
                    }
                } else {
                    skip_value(&mut r, vtype)?;
                }
            }
        }
    }

    Some(meta)
}

/// Estimate how many layers fit in the available VRAM, assuming weights are
/// spread evenly across blocks. File size is the weight proxy; a tenth is
/// reserved for runtime allocations.
pub fn estimate_gpu_layers(meta: &GgufMetadata, vram_bytes: u64) -> i32 {
    let blocks = match meta.block_count {
        Some(b) if b > 0 => b as u64,
        _ => return ALL_GPU_LAYERS,
    };
    if meta.file_size == 0 || vram_bytes == 0 {
        return ALL_GPU_LAYERS;
    }
    let per_layer = meta.file_size / blocks;
    if per_layer == 0 {
        return ALL_GPU_LAYERS;
    }
    let usable = vram_bytes - vram_bytes / 10;
    let layers = (usable / per_layer).min(blocks);
    layers as i32
}

/// Identify the model family, first from the stored chat template, then
/// from architecture, token ids and name.
pub fn identify_family(meta: &GgufMetadata) -> TemplateFamily {
    let tpl = meta.chat_template.as_str();
    if !tpl.is_empty() {
        if tpl.contains("<|start_header_id|>") {
            return TemplateFamily::LLaMa3;
        }
        if tpl.contains("<|START_OF_TURN_TOKEN|>") {
            return TemplateFamily::CommandR;
        }
        if tpl.contains("<|im_start|>") {
            return TemplateFamily::ChatML;
        }
        if tpl.contains("<|assistant|>") && tpl.contains("<|end|>") {
            return TemplateFamily::Phi3;
        }
        if tpl.contains("<start_of_turn>") {
            return TemplateFamily::Gemma;
        }
        if tpl.contains("<｜Assistant｜>") || tpl.contains("<｜User｜>") {
            return TemplateFamily::DeepSeek2;
        }
        if tpl.contains("[INST]") {
            return TemplateFamily::Mistral03;
        }
    }

    let arch = meta.architecture.as_str();
    let name = meta.name.to_lowercase();
    match arch {
        "command-r" => return TemplateFamily::CommandR,
        "phi3" => return TemplateFamily::Phi3,
        "gemma" | "gemma2" | "gemma3" => return TemplateFamily::Gemma,
        "deepseek2" => return TemplateFamily::DeepSeek2,
        "qwen2" | "qwen3" => return TemplateFamily::ChatML,
        "llama" => {
            if meta.eos_token_id == Some(128009) || name.contains("llama-3") || name.contains("llama3")
            {
                return TemplateFamily::LLaMa3;
            }
            if name.contains("mistral") {
                return TemplateFamily::Mistral03;
            }
        }
        _ => {}
    }
    if name.contains("command-r") {
        return TemplateFamily::CommandR;
    }
    if name.contains("phi-3") || name.contains("phi3") {
        return TemplateFamily::Phi3;
    }
    if name.contains("chatml") || name.contains("hermes") {
        return TemplateFamily::ChatML;
    }
    TemplateFamily::Unknown
}

/// Template preset and stop words for a family.
pub fn family_preset(family: TemplateFamily) -> Option<(TemplateConfig, Vec<String>)> {
    let preset = match family {
        TemplateFamily::LLaMa3 => (
            TemplateConfig {
                chat: "<|begin_of_text|>{{.Input }}\n<|start_header_id|>assistant<|end_header_id|>\n\n".into(),
                chat_message: "<|start_header_id|>{{ .RoleName }}<|end_header_id|>\n\n{{.Content }}<|eot_id|>".into(),
                completion: "{{.Input}}".into(),
                function: "<|start_header_id|>system<|end_header_id|>\n\nYou have access to the following functions:\n{{.Functions}}<|eot_id|>{{.Input }}".into(),
                ..Default::default()
            },
            vec!["<|eot_id|>".into(), "<|end_of_text|>".into()],
        ),
        TemplateFamily::CommandR => (
            TemplateConfig {
                chat: "{{.Input }}<|START_OF_TURN_TOKEN|><|CHATBOT_TOKEN|>".into(),
                chat_message: "<|START_OF_TURN_TOKEN|><|{{if eq .RoleName \"user\"}}USER{{else if eq .RoleName \"system\"}}SYSTEM{{else}}CHATBOT{{end}}_TOKEN|>{{.Content }}<|END_OF_TURN_TOKEN|>".into(),
                completion: "{{.Input}}".into(),
                ..Default::default()
            },
            vec!["<|END_OF_TURN_TOKEN|>".into()],
        ),
        TemplateFamily::Phi3 => (
            TemplateConfig {
                chat: "{{.Input }}\n<|assistant|>\n".into(),
                chat_message: "<|{{ .RoleName }}|>\n{{.Content }}<|end|>".into(),
                completion: "{{.Input}}".into(),
                ..Default::default()
            },
            vec!["<|end|>".into(), "<|endoftext|>".into()],
        ),
        TemplateFamily::ChatML => (
            TemplateConfig {
                chat: "{{.Input }}\n<|im_start|>assistant\n".into(),
                chat_message: "<|im_start|>{{ .RoleName }}\n{{.Content }}<|im_end|>".into(),
                completion: "{{.Input}}".into(),
                function: "<|im_start|>system\nYou have access to the following functions:\n{{.Functions}}<|im_end|>\n{{.Input }}\n<|im_start|>assistant\n".into(),
                ..Default::default()
            },
            vec!["<|im_end|>".into(), "<|endoftext|>".into()],
        ),
        TemplateFamily::Mistral03 => (
            TemplateConfig {
                chat: "{{.Input }}".into(),
                chat_message: "{{if eq .RoleName \"user\"}}[INST] {{.Content }} [/INST]{{else}}{{.Content }}</s>{{end}}".into(),
                completion: "{{.Input}}".into(),
                ..Default::default()
            },
            vec!["</s>".into()],
        ),
        TemplateFamily::Gemma => (
            TemplateConfig {
                chat: "{{.Input }}\n<start_of_turn>model\n".into(),
                chat_message: "<start_of_turn>{{if eq .RoleName \"assistant\"}}model{{else}}{{ .RoleName }}{{end}}\n{{.Content }}<end_of_turn>".into(),
                completion: "{{.Input}}".into(),
                ..Default::default()
            },
            vec!["<end_of_turn>".into()],
        ),
        TemplateFamily::DeepSeek2 => (
            TemplateConfig {
                chat: "{{.Input }}<｜Assistant｜>".into(),
                chat_message: "{{if eq .RoleName \"user\"}}<｜User｜>{{.Content }}{{else}}{{.Content }}<｜end▁of▁sentence｜>{{end}}".into(),
                completion: "{{.Input}}".into(),
                ..Default::default()
            },
            vec!["<｜end▁of▁sentence｜>".into()],
        ),
        TemplateFamily::Unknown => return None,
    };
    Some(preset)
}

/// Mutate a config in place based on the model file's header. No-op when
/// the file is missing or not GGUF.
pub fn guess_defaults_from_file(
    cfg: &mut ModelConfig,
    model_path: &Path,
    has_gpu: bool,
    vram_bytes: u64,
) {
    let meta = match parse_gguf_header(model_path) {
        Some(m) => m,
        None => return,
    };

    if cfg.context_size.is_none() {
        cfg.context_size = Some(match meta.context_length {
            Some(n) if n > 0 => n as i32,
            _ => DEFAULT_CONTEXT_SIZE,
        });
    }

    if cfg.options.is_none() && has_gpu {
        cfg.options = Some(vec!["gpu".to_string()]);
    }

    if cfg.gpu_layers.is_none() {
        cfg.gpu_layers = Some(if vram_bytes > 0 {
            estimate_gpu_layers(&meta, vram_bytes)
        } else {
            ALL_GPU_LAYERS
        });
    }

    if cfg.name.is_empty() {
        cfg.name = meta.name.clone();
    }

    if cfg.has_template() {
        return;
    }

    let family = identify_family(&meta);
    tracing::debug!(
        model = %cfg.name,
        architecture = %meta.architecture,
        family = ?family,
        "guessed model family"
    );

    match family_preset(family) {
        Some((template, stopwords)) => {
            cfg.template = template;
            if cfg.stopwords.is_empty() {
                cfg.stopwords = stopwords;
            }
        }
        None => {
            if !meta.chat_template.is_empty() {
                cfg.template.jinja_template = meta.chat_template.clone();
                if !cfg.known_usecases.contains(&"chat".to_string()) {
                    cfg.known_usecases.push("chat".to_string());
                }
            }
        }
    }
}

fn read_u32(r: &mut impl Read) -> Option<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf).ok()?;
    Some(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Option<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf).ok()?;
    Some(u64::from_le_bytes(buf))
}

fn read_string(r: &mut (impl Read + Seek), cap: u64) -> Option<String> {
    let len = read_u64(r)?;
    if len > cap {
        r.seek(SeekFrom::Current(len as i64)).ok()?;
        return Some(String::new());
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn skip_value(r: &mut (impl Read + Seek), vtype: u32) -> Option<()> {
    match vtype {
        // u8, i8, bool
        0 | 1 | 7 => {
            r.seek(SeekFrom::Current(1)).ok()?;
        }
        // u16, i16
        2 | 3 => {
            r.seek(SeekFrom::Current(2)).ok()?;
        }
        // u32, i32, f32
        4 | 5 | 6 => {
            r.seek(SeekFrom::Current(4)).ok()?;
        }
        // string
        8 => {
            read_string(r, 0)?;
        }
        // array
        9 => {
            let elem_type = read_u32(r)?;
            let count = read_u64(r)?;
            for _ in 0..count {
                skip_value(r, elem_type)?;
            }
        }
        // u64, i64, f64
        10 | 11 | 12 => {
            r.seek(SeekFrom::Current(8)).ok()?;
        }
        _ => return None,
    }
    Some(())
}
