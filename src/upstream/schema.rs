//! Translation between OpenAI-compatible payloads and Gemini payloads.
//!
//! Everything here operates on [`serde_json::Value`]: both sides are loosely
//! typed, clients send extra fields freely, and the translation only touches
//! the fields it knows about.

use base64::Engine as _;
use futures_util::StreamExt as _;
use serde_json::{json, Map, Value};

use crate::error::violation;

/// Largest remote image fetched for inlining (20 MiB, the upstream inline limit).
const MAX_IMAGE_BYTES: usize = 20 * 1024 * 1024;

/// Joins multiple text parts of one candidate into a single content string.
pub const PART_SEPARATOR: &str = "\n\n|>";

const HARM_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

/// OpenAI sampling field -> Gemini `generationConfig` field.
const FIELD_MAP: [(&str, &str); 10] = [
    ("frequency_penalty", "frequencyPenalty"),
    ("max_completion_tokens", "maxOutputTokens"),
    ("max_tokens", "maxOutputTokens"),
    ("n", "candidateCount"),
    ("presence_penalty", "presencePenalty"),
    ("seed", "seed"),
    ("stop", "stopSequences"),
    ("temperature", "temperature"),
    ("top_k", "topK"),
    ("top_p", "topP"),
];

/// Model families passed through to upstream unchanged.
const PASSTHROUGH_PREFIXES: [&str; 3] = ["gemini-", "gemma-", "learnlm-"];

/// Prefix for tool call ids the gateway generated itself. Such ids are not
/// echoed back upstream.
const GENERATED_CALL_PREFIX: &str = "call_";

// ---------------------------------------------------------------------------
// Model selection
// ---------------------------------------------------------------------------

/// Resolved chat model plus whether grounding search should be enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatModel {
    pub name: String,
    pub search: bool,
}

/// Pick the upstream chat model for a requested name.
///
/// `models/<x>` selects `<x>`; names from a known Gemini family pass through;
/// anything else falls back to `default`. A `:search` suffix, or a requested
/// name ending in `-search-preview`, turns on grounding search.
pub fn resolve_chat_model(requested: Option<&str>, default: &str) -> ChatModel {
    let mut name = default.to_owned();
    if let Some(m) = requested {
        if let Some(rest) = m.strip_prefix("models/") {
            name = rest.to_owned();
        } else if PASSTHROUGH_PREFIXES.iter().any(|p| m.starts_with(p)) {
            name = m.to_owned();
        }
    }
    let mut search = false;
    if let Some(base) = name.strip_suffix(":search") {
        name = base.to_owned();
        search = true;
    } else if requested.is_some_and(|m| m.ends_with("-search-preview")) {
        search = true;
    }
    ChatModel { name, search }
}

/// Pick the upstream embeddings model, always in `models/<x>` form.
pub fn resolve_embeddings_model(requested: Option<&Value>, default: &str) -> anyhow::Result<String> {
    let Some(m) = requested.and_then(Value::as_str) else {
        return Err(violation("model is not specified"));
    };
    if m.starts_with("models/") {
        return Ok(m.to_owned());
    }
    let name = if m.starts_with("gemini-") { m } else { default };
    Ok(format!("models/{name}"))
}

/// Append the grounding search tool to a built `generateContent` body.
pub fn add_search_tool(body: &mut Value) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let tools = obj.entry("tools").or_insert_with(|| json!([]));
    if let Some(list) = tools.as_array_mut() {
        list.push(json!({ "googleSearch": {} }));
    }
}

// ---------------------------------------------------------------------------
// Chat request
// ---------------------------------------------------------------------------

/// Build a Gemini `generateContent` body from an OpenAI chat completion request.
///
/// `http` is used to fetch remote `image_url` parts and inline them.
pub async fn build_generate_request(req: &Value, http: &reqwest::Client) -> anyhow::Result<Value> {
    let messages = match req.get("messages") {
        Some(Value::Array(items)) => items.as_slice(),
        None | Some(Value::Null) => &[],
        Some(_) => return Err(violation("messages must be an array")),
    };
    let (system_instruction, contents) = transform_messages(messages, http).await?;

    let mut body = Map::new();
    if let Some(system) = system_instruction {
        body.insert("system_instruction".into(), system);
    }
    body.insert("contents".into(), Value::Array(contents));
    body.insert("safetySettings".into(), safety_settings());
    body.insert("generationConfig".into(), generation_config(req)?);

    if let Some(tools) = req.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter(|t| t.get("type").and_then(Value::as_str) == Some("function"))
            .map(|t| {
                let mut t = t.clone();
                adjust_schema(&mut t);
                t.get("function").cloned().unwrap_or(Value::Null)
            })
            .collect();
        body.insert("tools".into(), json!([{ "function_declarations": declarations }]));
    }
    if let Some(config) = tool_config(req.get("tool_choice")) {
        body.insert("tool_config".into(), config);
    }
    Ok(Value::Object(body))
}

fn safety_settings() -> Value {
    HARM_CATEGORIES
        .iter()
        .map(|category| json!({ "category": category, "threshold": "BLOCK_NONE" }))
        .collect()
}

fn generation_config(req: &Value) -> anyhow::Result<Value> {
    let mut cfg = Map::new();
    for (from, to) in FIELD_MAP {
        if let Some(v) = req.get(from) {
            cfg.insert(to.into(), v.clone());
        }
    }
    let Some(format) = req.get("response_format") else {
        return Ok(Value::Object(cfg));
    };
    match format.get("type").and_then(Value::as_str) {
        Some("json_schema") => {
            let mut format = format.clone();
            adjust_schema(&mut format);
            let schema = format.pointer("/json_schema/schema").cloned();
            let is_enum = schema.as_ref().is_some_and(|s| s.get("enum").is_some());
            if let Some(schema) = schema {
                cfg.insert("responseSchema".into(), schema);
            }
            let mime = if is_enum { "text/x.enum" } else { "application/json" };
            cfg.insert("responseMimeType".into(), mime.into());
        }
        Some("json_object") => {
            cfg.insert("responseMimeType".into(), "application/json".into());
        }
        Some("text") => {
            cfg.insert("responseMimeType".into(), "text/plain".into());
        }
        _ => return Err(violation("Unsupported response_format.type")),
    }
    Ok(Value::Object(cfg))
}

fn tool_config(choice: Option<&Value>) -> Option<Value> {
    let choice = choice?;
    let (mode, allowed) = match choice {
        Value::String(mode) => (mode.to_uppercase(), None),
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("function") => {
            let name = choice.pointer("/function/name").cloned().unwrap_or(Value::Null);
            ("ANY".to_owned(), Some(json!([name])))
        }
        _ => return None,
    };
    let mut config = json!({ "mode": mode });
    if let Some(allowed) = allowed {
        config["allowed_function_names"] = allowed;
    }
    Some(json!({ "function_calling_config": config }))
}

/// Strip keys Gemini rejects from an OpenAI schema wrapper.
///
/// The object under `schema[schema.type]` loses `strict`, and every nested
/// object schema loses `additionalProperties: false`.
fn adjust_schema(schema: &mut Value) {
    if let Some(ty) = schema.get("type").and_then(Value::as_str).map(str::to_owned) {
        if let Some(inner) = schema.get_mut(&ty).and_then(Value::as_object_mut) {
            inner.remove("strict");
        }
    }
    adjust_props(schema);
}

fn adjust_props(value: &mut Value) {
    match value {
        Value::Array(items) => items.iter_mut().for_each(adjust_props),
        Value::Object(obj) => {
            let closed_object = obj.get("type").and_then(Value::as_str) == Some("object")
                && obj.contains_key("properties")
                && obj.get("additionalProperties") == Some(&Value::Bool(false));
            if closed_object {
                obj.remove("additionalProperties");
            }
            obj.values_mut().for_each(adjust_props);
        }
        _ => {}
    }
}

/// One `contents` entry under construction.
///
/// `calls` maps tool call ids of a model turn to (position, function name), so
/// tool results can be slotted into the matching position of the following
/// function turn.
struct Turn {
    role: &'static str,
    parts: Vec<Option<Value>>,
    calls: Option<Vec<(String, usize, String)>>,
}

impl Turn {
    fn new(role: &'static str, parts: Vec<Value>) -> Self {
        Self {
            role,
            parts: parts.into_iter().map(Some).collect(),
            calls: None,
        }
    }

    fn into_value(self) -> Value {
        let parts: Vec<Value> = self.parts.into_iter().flatten().collect();
        json!({ "role": self.role, "parts": parts })
    }
}

async fn transform_messages(
    messages: &[Value],
    http: &reqwest::Client,
) -> anyhow::Result<(Option<Value>, Vec<Value>)> {
    let mut system_instruction = None;
    let mut turns: Vec<Turn> = Vec::new();

    for item in messages {
        let role = item.get("role").and_then(Value::as_str).unwrap_or_default();
        match role {
            "system" => {
                let parts = transform_content(item.get("content"), http).await?;
                system_instruction = Some(json!({ "parts": parts }));
            }
            "tool" => {
                if turns.last().map(|t| t.role) != Some("function") {
                    let calls = turns.last().and_then(|t| t.calls.clone());
                    turns.push(Turn {
                        role: "function",
                        parts: Vec::new(),
                        calls,
                    });
                }
                if let Some(turn) = turns.last_mut() {
                    apply_tool_result(item, turn)?;
                }
            }
            "user" => {
                let parts = transform_content(item.get("content"), http).await?;
                turns.push(Turn::new("user", parts));
            }
            "assistant" => match item.get("tool_calls").and_then(Value::as_array) {
                Some(tool_calls) => turns.push(transform_tool_calls(tool_calls)?),
                None => {
                    let parts = transform_content(item.get("content"), http).await?;
                    turns.push(Turn::new("model", parts));
                }
            },
            other => return Err(violation(format!("Unknown message role: \"{other}\""))),
        }
    }

    if system_instruction.is_some() {
        let first_has_text = turns.first().is_some_and(|t| {
            t.parts.iter().flatten().any(|p| {
                p.get("text")
                    .and_then(Value::as_str)
                    .is_some_and(|s| !s.is_empty())
            })
        });
        if !first_has_text {
            turns.insert(0, Turn::new("user", vec![json!({ "text": " " })]));
        }
    }

    Ok((system_instruction, turns.into_iter().map(Turn::into_value).collect()))
}

fn transform_tool_calls(tool_calls: &[Value]) -> anyhow::Result<Turn> {
    let mut calls = Vec::with_capacity(tool_calls.len());
    let mut parts = Vec::with_capacity(tool_calls.len());
    for (i, call) in tool_calls.iter().enumerate() {
        let kind = call.get("type").and_then(Value::as_str).unwrap_or_default();
        if kind != "function" {
            return Err(violation(format!("Unsupported tool_call type: \"{kind}\"")));
        }
        let function = call.get("function").unwrap_or(&Value::Null);
        let name = function.get("name").and_then(Value::as_str).unwrap_or_default();
        let raw_args = function.get("arguments").and_then(Value::as_str).unwrap_or_default();
        let args: Value = serde_json::from_str(raw_args)
            .map_err(|_| violation(format!("Invalid function arguments: {raw_args}")))?;
        let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
        calls.push((id.to_owned(), i, name.to_owned()));
        parts.push(Some(json!({
            "functionCall": {
                "id": upstream_call_id(id),
                "name": name,
                "args": args,
            }
        })));
    }
    Ok(Turn {
        role: "model",
        parts,
        calls: Some(calls),
    })
}

fn apply_tool_result(item: &Value, turn: &mut Turn) -> anyhow::Result<()> {
    let Some(calls) = &turn.calls else {
        return Err(violation("No function calls found in the previous message"));
    };
    let raw = item.get("content").and_then(Value::as_str).unwrap_or_default();
    let mut response: Value = serde_json::from_str(raw)
        .map_err(|_| violation(format!("Invalid function response: {raw}")))?;
    if !response.is_object() {
        response = json!({ "result": response });
    }
    let id = item
        .get("tool_call_id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| violation("tool_call_id not specified"))?;
    let (position, name) = calls
        .iter()
        .find(|(call_id, _, _)| call_id == id)
        .map(|(_, position, name)| (*position, name.clone()))
        .ok_or_else(|| violation(format!("Unknown tool_call_id: \"{id}\"")))?;

    if turn.parts.len() <= position {
        turn.parts.resize(position + 1, None);
    }
    if turn.parts[position].is_some() {
        return Err(violation(format!("Duplicated tool_call_id: \"{id}\"")));
    }
    turn.parts[position] = Some(json!({
        "functionResponse": {
            "id": upstream_call_id(id),
            "name": name,
            "response": response,
        }
    }));
    Ok(())
}

fn upstream_call_id(id: &str) -> Value {
    if id.starts_with(GENERATED_CALL_PREFIX) {
        Value::Null
    } else {
        Value::String(id.to_owned())
    }
}

async fn transform_content(content: Option<&Value>, http: &reqwest::Client) -> anyhow::Result<Vec<Value>> {
    let items = match content {
        Some(Value::Array(items)) => items,
        other => return Ok(vec![json!({ "text": other.cloned().unwrap_or(Value::Null) })]),
    };
    let mut parts = Vec::with_capacity(items.len() + 1);
    for item in items {
        let kind = item.get("type").and_then(Value::as_str).unwrap_or_default();
        match kind {
            "text" => parts.push(json!({ "text": item.get("text").cloned().unwrap_or(Value::Null) })),
            "image_url" => {
                let url = item
                    .pointer("/image_url/url")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                parts.push(inline_image(url, http).await?);
            }
            "input_audio" => {
                let format = item.pointer("/input_audio/format").and_then(Value::as_str).unwrap_or_default();
                let data = item.pointer("/input_audio/data").cloned().unwrap_or(Value::Null);
                parts.push(json!({
                    "inlineData": { "mimeType": format!("audio/{format}"), "data": data }
                }));
            }
            other => return Err(violation(format!("Unknown \"content\" item type: \"{other}\""))),
        }
    }
    if items
        .iter()
        .all(|i| i.get("type").and_then(Value::as_str) == Some("image_url"))
    {
        // Upstream rejects turns made only of images.
        parts.push(json!({ "text": "" }));
    }
    Ok(parts)
}

/// Turn an image URL into an `inlineData` part.
///
/// `http(s)` URLs are fetched; `data:` URLs are decoded in place.
async fn inline_image(url: &str, http: &reqwest::Client) -> anyhow::Result<Value> {
    fetch_image(url, http, MAX_IMAGE_BYTES).await
}

async fn fetch_image(url: &str, http: &reqwest::Client, limit: usize) -> anyhow::Result<Value> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Error fetching image: {e}"))?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Error fetching image: {status} ({url})");
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_owned();
        let too_large = || violation(format!("Image exceeds {limit} bytes: {url}"));
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }
        let mut bytes = Vec::new();
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| anyhow::anyhow!("Error fetching image: {e}"))?;
            if bytes.len() + chunk.len() > limit {
                return Err(too_large());
            }
            bytes.extend_from_slice(&chunk);
        }
        let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
        return Ok(json!({ "inlineData": { "mimeType": mime, "data": data } }));
    }

    let (mime, data) = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .map(|(meta, data)| (meta.strip_suffix(";base64").unwrap_or(meta), data))
        .ok_or_else(|| violation(format!("Invalid image data: {url}")))?;
    Ok(json!({ "inlineData": { "mimeType": mime, "data": data } }))
}

// ---------------------------------------------------------------------------
// Chat response
// ---------------------------------------------------------------------------

/// Map an upstream finish reason to the OpenAI vocabulary. Unknown reasons
/// pass through unchanged.
pub fn map_finish_reason(reason: &str) -> &str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        other => other,
    }
}

/// Map one upstream candidate to an OpenAI choice, with the message placed
/// under `key` (`"message"` for full responses, `"delta"` for stream chunks).
pub fn candidate_to_choice(candidate: &Value, key: &str) -> Value {
    let mut texts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();
    let parts = candidate.pointer("/content/parts").and_then(Value::as_array);
    for part in parts.into_iter().flatten() {
        match part.get("functionCall") {
            Some(call) => {
                let id = call
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("{GENERATED_CALL_PREFIX}{}", generate_id()));
                let arguments = call.get("args").unwrap_or(&Value::Null).to_string();
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": call.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    }
                }));
            }
            None => texts.push(part.get("text").and_then(Value::as_str).unwrap_or_default()),
        }
    }

    let content = texts.join(PART_SEPARATOR);
    let mut message = json!({
        "role": "assistant",
        "content": if content.is_empty() { Value::Null } else { Value::String(content) },
    });
    let finish_reason = if tool_calls.is_empty() {
        candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .map(|r| Value::String(map_finish_reason(r).to_owned()))
            .unwrap_or(Value::Null)
    } else {
        message["tool_calls"] = Value::Array(tool_calls);
        Value::String("tool_calls".into())
    };

    let mut choice = Map::new();
    choice.insert("index".into(), json!(candidate.get("index").and_then(Value::as_u64).unwrap_or(0)));
    choice.insert(key.into(), message);
    choice.insert("logprobs".into(), Value::Null);
    choice.insert("finish_reason".into(), finish_reason);
    Value::Object(choice)
}

/// Synthesize the single terminal choice for a prompt upstream blocked.
pub fn prompt_block_choice(feedback: Option<&Value>, key: &str) -> Option<Value> {
    feedback?.get("blockReason")?;
    let mut choice = Map::new();
    choice.insert("index".into(), json!(0));
    choice.insert(key.into(), Value::Null);
    choice.insert("finish_reason".into(), "content_filter".into());
    Some(Value::Object(choice))
}

/// Map upstream usage metadata to OpenAI usage. Absent counts stay absent.
pub fn usage(metadata: &Value) -> Value {
    let mut usage = Map::new();
    for (from, to) in [
        ("candidatesTokenCount", "completion_tokens"),
        ("promptTokenCount", "prompt_tokens"),
        ("totalTokenCount", "total_tokens"),
    ] {
        if let Some(v) = metadata.get(from) {
            usage.insert(to.into(), v.clone());
        }
    }
    Value::Object(usage)
}

/// Build the full (non-streaming) `chat.completion` response.
pub fn completion_response(data: &Value, model: &str, id: &str, created: i64) -> Value {
    let mut choices: Vec<Value> = data
        .get("candidates")
        .and_then(Value::as_array)
        .map(|c| c.iter().map(|c| candidate_to_choice(c, "message")).collect())
        .unwrap_or_default();
    if choices.is_empty() {
        choices.extend(prompt_block_choice(data.get("promptFeedback"), "message"));
    }
    let mut out = json!({
        "id": id,
        "choices": choices,
        "created": created,
        "model": data.get("modelVersion").and_then(Value::as_str).unwrap_or(model),
        "object": "chat.completion",
    });
    if let Some(metadata) = data.get("usageMetadata") {
        out["usage"] = usage(metadata);
    }
    out
}

/// Random identifier for completions and tool calls.
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// ---------------------------------------------------------------------------
// Embeddings and models
// ---------------------------------------------------------------------------

/// Build a `batchEmbedContents` body. A bare string input becomes a batch of one.
pub fn build_embed_request(req: &Value, model: &str) -> anyhow::Result<Value> {
    let inputs: Vec<Value> = match req.get("input") {
        Some(Value::Array(items)) => items.clone(),
        Some(Value::Null) | None => return Err(violation("input is not specified")),
        Some(single) => vec![single.clone()],
    };
    let dimensions = req.get("dimensions").cloned().unwrap_or(Value::Null);
    let requests: Vec<Value> = inputs
        .into_iter()
        .map(|text| {
            let mut request = json!({
                "model": model,
                "content": { "parts": [{ "text": text }] },
            });
            if !dimensions.is_null() {
                request["outputDimensionality"] = dimensions.clone();
            }
            request
        })
        .collect();
    Ok(json!({ "requests": requests }))
}

/// Map a `batchEmbedContents` response to an OpenAI embeddings list.
pub fn embeddings_response(data: &Value, requested_model: &Value) -> Value {
    let items: Vec<Value> = data
        .get("embeddings")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .enumerate()
        .map(|(index, e)| {
            json!({
                "object": "embedding",
                "index": index,
                "embedding": e.get("values").cloned().unwrap_or(Value::Null),
            })
        })
        .collect();
    json!({ "object": "list", "data": items, "model": requested_model })
}

/// Map an upstream model listing to an OpenAI model list.
pub fn models_response(data: &Value) -> Value {
    let items: Vec<Value> = data
        .get("models")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|m| m.get("name").and_then(Value::as_str))
        .map(|name| {
            json!({
                "id": name.strip_prefix("models/").unwrap_or(name),
                "object": "model",
                "created": 0,
                "owned_by": "",
            })
        })
        .collect();
    json!({ "object": "list", "data": items })
}
