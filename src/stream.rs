//! Incremental transcoding of the upstream event stream into OpenAI chunks.
//!
//! The upstream body arrives as arbitrary byte chunks of a `data: <json>`
//! event stream. Two stages run over it, both driven by one [`StreamState`]
//! per response:
//!
//! 1. frame splitting ([`split_frames`] / [`flush_frames`]): reassembles
//!    complete `data:` frames regardless of how the bytes were chunked, and
//!    hands back whatever is left at end of stream;
//! 2. delta transformation ([`DeltaTransformer`]): turns each frame's JSON
//!    into `chat.completion.chunk` lines, emitting a role preamble the first
//!    time a choice index appears and holding back each index's finish
//!    reason and usage until the end.
//!
//! [`Transcoder`] glues both stages together, and [`transcode`] drives it over
//! a live byte stream.

use std::{collections::BTreeMap, pin::Pin};

use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn, Instrument as _};

use crate::upstream::schema;

/// Separator written after every emitted line.
pub const DELIMITER: &str = "\n\n";

const DATA_PREFIX: &str = "data: ";

/// Frame terminators accepted from upstream, longest first.
const TERMINATORS: [&str; 3] = ["\r\n\r\n", "\n\n", "\r\r"];

/// Boxed stream of ready-to-send event stream bytes.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Per-response transcoding state.
#[derive(Debug, Default)]
pub struct StreamState {
    /// Decoded text not yet consumed as a frame.
    buffer: String,
    /// Trailing bytes of an incomplete UTF-8 sequence.
    pending_utf8: Vec<u8>,
    /// Most recent envelope per choice index, finish reason and usage restored.
    last_by_index: BTreeMap<u64, Value>,
    /// Set once the end-of-stream leftover has been handed out.
    malformed_tail: bool,
}

impl StreamState {
    pub fn malformed_tail(&self) -> bool {
        self.malformed_tail
    }
}

// ---------------------------------------------------------------------------
// Frame splitting
// ---------------------------------------------------------------------------

/// Append `chunk` to the buffer and return every complete frame payload.
///
/// A frame is `data: ` at the start of the buffer, a payload running to the
/// first line break, then one of the accepted terminators. Consumed frames are
/// removed from the buffer.
pub fn split_frames(state: &mut StreamState, chunk: &str) -> Vec<String> {
    state.buffer.push_str(chunk);
    let mut frames = Vec::new();
    while let Some((payload, consumed)) = next_frame(&state.buffer) {
        frames.push(payload);
        state.buffer.drain(..consumed);
    }
    frames
}

/// Hand back any unconsumed text at end of stream, marking it malformed.
pub fn flush_frames(state: &mut StreamState) -> Option<String> {
    if !state.pending_utf8.is_empty() {
        let rest = std::mem::take(&mut state.pending_utf8);
        state.buffer.push_str(&String::from_utf8_lossy(&rest));
    }
    if state.buffer.is_empty() {
        return None;
    }
    state.malformed_tail = true;
    warn!(len = state.buffer.len(), "upstream stream ended with an incomplete frame");
    Some(std::mem::take(&mut state.buffer))
}

fn next_frame(buffer: &str) -> Option<(String, usize)> {
    let rest = buffer.strip_prefix(DATA_PREFIX)?;
    let end = rest.find(['\r', '\n'])?;
    let tail = &rest[end..];
    let terminator = TERMINATORS.iter().find(|t| tail.starts_with(*t))?;
    Some((
        rest[..end].to_owned(),
        DATA_PREFIX.len() + end + terminator.len(),
    ))
}

/// Decode `bytes`, carrying an incomplete trailing UTF-8 sequence over to the
/// next call. Invalid sequences become U+FFFD.
fn decode_utf8(state: &mut StreamState, bytes: &[u8]) -> String {
    state.pending_utf8.extend_from_slice(bytes);
    let mut out = String::new();
    loop {
        match std::str::from_utf8(&state.pending_utf8) {
            Ok(s) => {
                out.push_str(s);
                state.pending_utf8.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&state.pending_utf8[..valid]));
                match e.error_len() {
                    None => {
                        state.pending_utf8.drain(..valid);
                        return out;
                    }
                    Some(len) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        state.pending_utf8.drain(..valid + len);
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Delta transformation
// ---------------------------------------------------------------------------

/// Turns upstream frame payloads into OpenAI `chat.completion.chunk` lines.
#[derive(Debug, Clone)]
pub struct DeltaTransformer {
    id: String,
    model: String,
    include_usage: bool,
}

impl DeltaTransformer {
    pub fn new(id: impl Into<String>, model: impl Into<String>, include_usage: bool) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            include_usage,
        }
    }

    /// Transform one frame payload.
    ///
    /// Payloads that are not JSON, or lack a `candidates` array, are passed
    /// through verbatim (followed by the delimiter unless this is the
    /// end-of-stream leftover).
    pub fn transform(&self, state: &mut StreamState, payload: &str) -> Vec<String> {
        let data = match serde_json::from_str::<Value>(payload) {
            Ok(v) if v.get("candidates").is_some_and(Value::is_array) => v,
            _ => {
                warn!(len = payload.len(), "passing through unrecognized stream frame");
                let mut line = payload.to_owned();
                if !state.malformed_tail {
                    line.push_str(DELIMITER);
                }
                return vec![line];
            }
        };

        let candidates = data["candidates"].as_array().map(Vec::as_slice).unwrap_or_default();
        let mut choices: Vec<Value> = candidates
            .iter()
            .map(|c| schema::candidate_to_choice(c, "delta"))
            .collect();
        let usage_requested = self.include_usage && data.get("usageMetadata").is_some();

        let model = data
            .get("modelVersion")
            .and_then(Value::as_str)
            .unwrap_or(&self.model);
        let mut envelope = json!({
            "id": self.id,
            "choices": [],
            "model": model,
            "object": "chat.completion.chunk",
        });
        if usage_requested {
            envelope["usage"] = Value::Null;
        }

        if choices.is_empty() {
            choices.extend(schema::prompt_block_choice(data.get("promptFeedback"), "delta"));
            envelope["choices"] = Value::Array(choices);
            return vec![sse_line(envelope)];
        }
        if choices.len() > 1 {
            warn!(count = choices.len(), "multiple candidates in stream chunk; only the first is tracked");
        }

        let index = choices[0]["index"].as_u64().unwrap_or(0);
        let finish_reason = std::mem::take(&mut choices[0]["finish_reason"]);
        envelope["choices"] = Value::Array(choices);

        let mut out = Vec::new();
        if !state.last_by_index.contains_key(&index) {
            let mut preamble = envelope.clone();
            let mut first = envelope["choices"][0].clone();
            first["delta"] = json!({ "role": "assistant", "content": "" });
            preamble["choices"] = json!([first]);
            out.push(sse_line(preamble));
        }

        if let Some(delta) = envelope["choices"][0]
            .get_mut("delta")
            .and_then(Value::as_object_mut)
        {
            delta.remove("role");
        }
        if carries_content(&envelope["choices"][0]["delta"]) {
            out.push(sse_line(envelope.clone()));
        }

        envelope["choices"][0]["finish_reason"] = finish_reason;
        if usage_requested {
            envelope["usage"] = schema::usage(&data["usageMetadata"]);
        }
        envelope["choices"][0]["delta"] = json!({});
        state.last_by_index.insert(index, envelope);
        out
    }

    /// Emit every retained envelope in index order, then the `[DONE]` marker.
    /// Emits nothing if no candidate was ever seen.
    pub fn flush(&self, state: &mut StreamState) -> Vec<String> {
        if state.last_by_index.is_empty() {
            return Vec::new();
        }
        let mut out: Vec<String> = std::mem::take(&mut state.last_by_index)
            .into_values()
            .map(sse_line)
            .collect();
        out.push(format!("{DATA_PREFIX}[DONE]{DELIMITER}"));
        out
    }
}

fn carries_content(delta: &Value) -> bool {
    delta.get("content").is_some_and(|c| !c.is_null()) || delta.get("tool_calls").is_some()
}

fn sse_line(mut envelope: Value) -> String {
    envelope["created"] = json!(chrono::Utc::now().timestamp());
    format!("{DATA_PREFIX}{envelope}{DELIMITER}")
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Both stages plus their shared state, fed one upstream chunk at a time.
#[derive(Debug)]
pub struct Transcoder {
    transformer: DeltaTransformer,
    state: StreamState,
}

impl Transcoder {
    pub fn new(transformer: DeltaTransformer) -> Self {
        Self {
            transformer,
            state: StreamState::default(),
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let text = decode_utf8(&mut self.state, bytes);
        let mut out = Vec::new();
        for payload in split_frames(&mut self.state, &text) {
            out.extend(self.transformer.transform(&mut self.state, &payload));
        }
        out
    }

    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(tail) = flush_frames(&mut self.state) {
            out.extend(self.transformer.transform(&mut self.state, &tail));
        }
        out.extend(self.transformer.flush(&mut self.state));
        out
    }
}

/// Drive `transcoder` over an upstream byte stream, yielding output lines as
/// soon as they are produced.
///
/// A reader task owns the upstream body; it stops when upstream ends, errors,
/// or the returned stream is dropped. The task runs inside the caller's span.
pub fn transcode<S, E>(upstream: S, mut transcoder: Transcoder) -> SseStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<anyhow::Result<Bytes>>(32);

    tokio::spawn(async move {
        let mut upstream = Box::pin(upstream);
        while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(b) => b,
                Err(e) => {
                    let _ = tx
                        .send(Err(anyhow::Error::new(e).context("reading upstream stream")))
                        .await;
                    return;
                }
            };
            for line in transcoder.push(&bytes) {
                if tx.send(Ok(Bytes::from(line))).await.is_err() {
                    debug!("client went away; stopping upstream read");
                    return;
                }
            }
        }
        for line in transcoder.finish() {
            if tx.send(Ok(Bytes::from(line))).await.is_err() {
                return;
            }
        }
    }
    .instrument(tracing::Span::current()));

    Box::pin(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(json: &str) -> String {
        format!("data: {json}\r\n\r\n")
    }

    fn parse_line(line: &str) -> Value {
        let body = line
            .strip_prefix("data: ")
            .and_then(|l| l.strip_suffix("\n\n"))
            .unwrap_or_else(|| panic!("not an event line: {line:?}"));
        serde_json::from_str(body).unwrap()
    }

    fn run(chunks: &[&[u8]], include_usage: bool) -> Vec<String> {
        let mut t = Transcoder::new(DeltaTransformer::new("chatcmpl-x", "gemini-2.0-flash", include_usage));
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(t.push(chunk));
        }
        out.extend(t.finish());
        out
    }

    // -----------------------------------------------------------------------
    // Frame splitting
    // -----------------------------------------------------------------------

    #[test]
    fn frames_are_split_on_every_terminator() {
        let mut state = StreamState::default();
        let frames = split_frames(&mut state, "data: a\n\ndata: b\r\rdata: c\r\n\r\ndata: d");
        assert_eq!(frames, vec!["a", "b", "c"]);
        assert_eq!(flush_frames(&mut state).as_deref(), Some("data: d"));
        assert!(state.malformed_tail());
    }

    #[test]
    fn frame_splitting_is_independent_of_chunk_boundaries() {
        let input = "data: {\"x\":1}\r\n\r\ndata: {\"y\":2}\n\ndata: {\"z\":3}\r\r";
        let mut whole = StreamState::default();
        let expected = split_frames(&mut whole, input);
        assert_eq!(expected.len(), 3);

        for cut in 0..=input.len() {
            let mut state = StreamState::default();
            let mut got = split_frames(&mut state, &input[..cut]);
            got.extend(split_frames(&mut state, &input[cut..]));
            assert_eq!(got, expected, "split at {cut}");
            assert_eq!(flush_frames(&mut state), None, "split at {cut}");
        }
    }

    #[test]
    fn single_newline_does_not_end_a_frame() {
        let mut state = StreamState::default();
        assert!(split_frames(&mut state, "data: a\n").is_empty());
        assert_eq!(split_frames(&mut state, "\n"), vec!["a"]);
    }

    #[test]
    fn clean_end_has_no_tail() {
        let mut state = StreamState::default();
        split_frames(&mut state, "data: a\n\n");
        assert_eq!(flush_frames(&mut state), None);
        assert!(!state.malformed_tail());
    }

    #[test]
    fn multibyte_characters_survive_byte_splits() {
        let input = "data: {\"t\":\"héllo ✓\"}\n\n".as_bytes();
        for cut in 0..=input.len() {
            let mut state = StreamState::default();
            let mut text = decode_utf8(&mut state, &input[..cut]);
            text.push_str(&decode_utf8(&mut state, &input[cut..]));
            let frames = split_frames(&mut state, &text);
            assert_eq!(frames, vec!["{\"t\":\"héllo ✓\"}"], "split at {cut}");
        }
    }

    // -----------------------------------------------------------------------
    // Delta transformation
    // -----------------------------------------------------------------------

    #[test]
    fn text_stream_emits_preamble_delta_and_final_chunks() {
        let out = run(
            &[
                frame(r#"{"candidates":[{"content":{"parts":[{"text":"Hel"}]},"index":0}]}"#).as_bytes(),
                frame(r#"{"candidates":[{"content":{"parts":[{"text":"lo"}]},"finishReason":"STOP","index":0}]}"#)
                    .as_bytes(),
            ],
            false,
        );
        assert_eq!(out.len(), 5, "{out:#?}");

        let preamble = parse_line(&out[0]);
        assert_eq!(preamble["object"], "chat.completion.chunk");
        assert_eq!(preamble["id"], "chatcmpl-x");
        assert_eq!(preamble["model"], "gemini-2.0-flash");
        assert_eq!(preamble["choices"][0]["delta"], json!({ "role": "assistant", "content": "" }));
        assert!(preamble["created"].is_i64());

        let first = parse_line(&out[1]);
        assert_eq!(first["choices"][0]["delta"], json!({ "content": "Hel" }));
        assert_eq!(first["choices"][0]["finish_reason"], Value::Null);

        let second = parse_line(&out[2]);
        assert_eq!(second["choices"][0]["delta"], json!({ "content": "lo" }));
        assert_eq!(second["choices"][0]["finish_reason"], Value::Null);

        let last = parse_line(&out[3]);
        assert_eq!(last["choices"][0]["delta"], json!({}));
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert!(last.get("usage").is_none());

        assert_eq!(out[4], "data: [DONE]\n\n");
    }

    #[test]
    fn preamble_is_emitted_once_per_index() {
        let out = run(
            &[
                frame(r#"{"candidates":[{"content":{"parts":[{"text":"a"}]}}]}"#).as_bytes(),
                frame(r#"{"candidates":[{"content":{"parts":[{"text":"b"}]}}]}"#).as_bytes(),
                frame(r#"{"candidates":[{"content":{"parts":[{"text":"c"}]},"index":1}]}"#).as_bytes(),
            ],
            false,
        );
        let preambles = out
            .iter()
            .filter(|l| l.contains("\"role\":\"assistant\""))
            .count();
        assert_eq!(preambles, 2);

        // One retained chunk per index, in index order, then [DONE].
        let tail: Vec<Value> = out[out.len() - 3..out.len() - 1].iter().map(|l| parse_line(l)).collect();
        assert_eq!(tail[0]["choices"][0]["index"], 0);
        assert_eq!(tail[1]["choices"][0]["index"], 1);
        assert_eq!(out.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn usage_is_attached_only_when_requested() {
        let chunk = frame(
            r#"{"candidates":[{"content":{"parts":[{"text":"x"}]},"finishReason":"MAX_TOKENS"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":5,"totalTokenCount":7}}"#,
        );

        let with = run(&[chunk.as_bytes()], true);
        let delta = parse_line(&with[1]);
        assert_eq!(delta["usage"], Value::Null);
        let last = parse_line(&with[2]);
        assert_eq!(last["choices"][0]["finish_reason"], "length");
        assert_eq!(
            last["usage"],
            json!({ "completion_tokens": 5, "prompt_tokens": 2, "total_tokens": 7 })
        );

        let without = run(&[chunk.as_bytes()], false);
        assert!(without.iter().filter(|l| l.starts_with("data: {")).all(|l| parse_line(l).get("usage").is_none()));
    }

    #[test]
    fn empty_delta_is_not_emitted() {
        let out = run(
            &[frame(r#"{"candidates":[{"content":{"parts":[]},"finishReason":"STOP"}]}"#).as_bytes()],
            false,
        );
        // preamble, retained final chunk, [DONE]
        assert_eq!(out.len(), 3, "{out:#?}");
        assert_eq!(parse_line(&out[1])["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn tool_call_delta_is_emitted() {
        let out = run(
            &[frame(r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"f","args":{}}}]},"finishReason":"STOP"}]}"#)
                .as_bytes()],
            false,
        );
        let delta = parse_line(&out[1]);
        assert_eq!(delta["choices"][0]["delta"]["tool_calls"][0]["function"]["name"], "f");
        assert_eq!(delta["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(parse_line(&out[2])["choices"][0]["finish_reason"], "tool_calls");
    }

    #[test]
    fn blocked_prompt_emits_single_content_filter_choice() {
        let out = run(
            &[frame(r#"{"promptFeedback":{"blockReason":"SAFETY"},"candidates":[]}"#).as_bytes()],
            false,
        );
        // No candidate was ever retained, so no [DONE] either.
        assert_eq!(out.len(), 1, "{out:#?}");
        let chunk = parse_line(&out[0]);
        assert_eq!(
            chunk["choices"],
            json!([{ "index": 0, "delta": null, "finish_reason": "content_filter" }])
        );
    }

    #[test]
    fn unrecognized_frames_pass_through_verbatim() {
        let out = run(
            &[
                b"data: not json\n\n",
                frame(r#"{"error":{"code":500}}"#).as_bytes(),
            ],
            false,
        );
        assert_eq!(out, vec!["not json\n\n".to_owned(), "{\"error\":{\"code\":500}}\n\n".to_owned()]);
    }

    #[test]
    fn malformed_tail_is_emitted_once_without_delimiter() {
        let out = run(&[b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}\n\ndata: trunc"], false);
        let tails: Vec<&String> = out.iter().filter(|l| l.as_str() == "data: trunc").collect();
        assert_eq!(tails.len(), 1);
        assert_eq!(out.last().unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn output_is_independent_of_chunk_boundaries() {
        let input = [
            frame(r#"{"candidates":[{"content":{"parts":[{"text":"Hé"}]},"index":0}]}"#),
            frame(r#"{"candidates":[{"content":{"parts":[{"text":"llo"}]},"finishReason":"STOP","index":0}]}"#),
        ]
        .concat();
        let bytes = input.as_bytes();

        let strip_created = |lines: Vec<String>| -> Vec<Value> {
            lines
                .iter()
                .map(|l| {
                    if l.starts_with("data: {") {
                        let mut v = parse_line(l);
                        v["created"] = Value::Null;
                        v
                    } else {
                        Value::String(l.clone())
                    }
                })
                .collect()
        };
        let expected = strip_created(run(&[bytes], false));

        for cut in (0..=bytes.len()).step_by(7) {
            let got = strip_created(run(&[&bytes[..cut], &bytes[cut..]], false));
            assert_eq!(got, expected, "split at {cut}");
        }
    }

    // -----------------------------------------------------------------------
    // Driver
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transcode_streams_lines_and_finishes() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from(frame(r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]},"finishReason":"STOP"}]}"#))),
        ];
        let transcoder = Transcoder::new(DeltaTransformer::new("id", "m", false));
        let lines: Vec<Bytes> = transcode(futures_util::stream::iter(chunks), transcoder)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], Bytes::from_static(b"data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn transcode_surfaces_upstream_errors() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))];
        let transcoder = Transcoder::new(DeltaTransformer::new("id", "m", false));
        let items: Vec<anyhow::Result<Bytes>> =
            transcode(futures_util::stream::iter(chunks), transcoder).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn transcode_logs_inside_the_request_span() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"data: {\"cand"))];
        let transcoder = Transcoder::new(DeltaTransformer::new("id", "m", false));
        let span = tracing::info_span!("request", id = "req-7");
        let lines: Vec<anyhow::Result<Bytes>> = async {
            transcode(futures_util::stream::iter(chunks), transcoder).collect().await
        }
        .instrument(span)
        .await;
        assert_eq!(lines.len(), 1);

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = logs
            .lines()
            .find(|l| l.contains("incomplete frame"))
            .unwrap_or_else(|| panic!("no tail warning in {logs}"));
        assert!(line.contains("req-7"), "span missing from {line}");
    }
}
