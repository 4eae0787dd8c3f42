//! Transcriber output post-processing.
//!
//! Upstream models return apologies, prompt echoes, and repetition loops
//! alongside genuine transcriptions. The scrub pipeline below is part of
//! the chunk contract: its steps run in a fixed order and each is covered
//! by tests with known-bad transcriber outputs.

/// Leading lines starting with any of these are dropped as refusal or
/// framing preambles.
const REFUSAL_PREAMBLES: &[&str] = &[
    "i cannot process audio",
    "i can't process audio",
    "i cannot transcribe",
    "i can't transcribe",
    "i'm unable to transcribe",
    "i am unable to transcribe",
    "i'm sorry",
    "i am sorry",
    "as an ai",
    "unfortunately, i",
    "here's the transcription",
    "here is the transcription",
    "here's the transcript",
    "here is the transcript",
    "sure, here's",
    "sure, here is",
];

/// Phrases marking the body as a refusal rather than a transcription
const REFUSAL_MARKERS: &[&str] = &[
    "cannot process",
    "can't process",
    "unable to transcribe",
    "cannot transcribe",
    "can't transcribe",
    "don't have the ability",
    "not able to listen",
];

/// Number of identical 5-word windows that marks a hallucination loop
const PHRASE_REPEAT_THRESHOLD: usize = 4;
const PHRASE_WINDOW: usize = 5;

/// Clean one raw transcriber output. Always returns something usable:
/// worst case `[silence]` or `[unclear]`.
pub fn scrub_transcription(raw: &str, prompt: &str) -> String {
    let text = strip_prompt_echo(raw, prompt);
    let text = strip_refusal_preambles(&text);
    let text = recover_speaker_lines(&text);
    let text = dedup_consecutive_lines(&text);
    let text = filter_repeated_phrases(&text);

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "[silence]".to_string();
    }
    if is_nonverbal_only(trimmed) && trimmed.len() < 200 {
        return "[silence]".to_string();
    }
    trimmed.to_string()
}

/// Remove a leading echo of the prompt text
fn strip_prompt_echo(raw: &str, prompt: &str) -> String {
    let trimmed = raw.trim_start();
    let prompt = prompt.trim();
    if prompt.is_empty() {
        return trimmed.to_string();
    }
    if let Some(rest) = trimmed.strip_prefix(prompt) {
        return rest.trim_start().to_string();
    }

    // Models sometimes echo individual prompt lines before the transcript
    let prompt_lines: Vec<&str> = prompt
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let mut lines: Vec<&str> = trimmed.lines().collect();
    while let Some(first) = lines.first() {
        let first = first.trim();
        if first.is_empty() || prompt_lines.contains(&first) {
            lines.remove(0);
        } else {
            break;
        }
    }
    lines.join("\n")
}

/// Drop leading refusal/framing lines
fn strip_refusal_preambles(text: &str) -> String {
    let mut lines: Vec<&str> = text.lines().collect();
    while let Some(first) = lines.first() {
        let lowered = first.trim().to_lowercase();
        if lowered.is_empty() {
            lines.remove(0);
            continue;
        }
        if REFUSAL_PREAMBLES.iter().any(|p| lowered.starts_with(p)) {
            lines.remove(0);
            continue;
        }
        break;
    }
    lines.join("\n")
}

/// If the body still reads as a refusal and carries no speaker label,
/// salvage the first speaker-labelled substring or give up with
/// `[unclear]`.
fn recover_speaker_lines(text: &str) -> String {
    let lowered = text.to_lowercase();
    let is_refusal = REFUSAL_MARKERS.iter().any(|m| lowered.contains(m));
    if !is_refusal {
        return text.to_string();
    }
    match text.find("[Speaker") {
        Some(idx) => text[idx..].to_string(),
        None => "[unclear]".to_string(),
    }
}

/// Collapse runs of identical lines, keeping the first
fn dedup_consecutive_lines(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for line in text.lines() {
        if let Some(prev) = out.last() {
            if prev.trim() == line.trim() && !line.trim().is_empty() {
                continue;
            }
        }
        out.push(line);
    }
    out.join("\n")
}

/// Phrase-level hallucination filter: when any 5-word window repeats at
/// least 4 times, keep the text up to the window's second occurrence.
/// Loops run to the end of the output in practice, so truncating there
/// keeps exactly the first instance.
fn filter_repeated_phrases(text: &str) -> String {
    let words = words_with_offsets(text);
    if words.len() < PHRASE_WINDOW * 2 {
        return text.to_string();
    }

    use std::collections::HashMap;
    let mut occurrences: HashMap<String, Vec<usize>> = HashMap::new();
    for window in words.windows(PHRASE_WINDOW) {
        let key = window
            .iter()
            .map(|(_, w)| w.to_lowercase())
            .collect::<Vec<_>>()
            .join(" ");
        occurrences.entry(key).or_default().push(window[0].0);
    }

    // Earliest second occurrence among looping windows wins
    let cut = occurrences
        .values()
        .filter(|offsets| offsets.len() >= PHRASE_REPEAT_THRESHOLD)
        .map(|offsets| offsets[1])
        .min();

    match cut {
        Some(offset) => text[..offset].trim_end().to_string(),
        None => text.to_string(),
    }
}

/// Whitespace-separated words with their byte offsets
fn words_with_offsets(text: &str) -> Vec<(usize, &str)> {
    let mut words = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in text.char_indices() {
        if c.is_whitespace() {
            if let Some(s) = start.take() {
                words.push((s, &text[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        words.push((s, &text[s..]));
    }
    words
}

/// True when every non-empty line is `[Speaker N]: [non-verbal]`
fn is_nonverbal_only(text: &str) -> bool {
    let mut saw_line = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        saw_line = true;
        if !is_nonverbal_line(line) {
            return false;
        }
    }
    saw_line
}

fn is_nonverbal_line(line: &str) -> bool {
    let rest = match line.strip_prefix("[Speaker ") {
        Some(r) => r,
        None => return false,
    };
    let (speaker, utterance) = match rest.split_once("]:") {
        Some(parts) => parts,
        None => return false,
    };
    if speaker.is_empty() || !speaker.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }
    let utterance = utterance.trim();
    utterance.starts_with('[') && utterance.ends_with(']')
}

/// Refusal/boilerplate phrases filtered out of chunk texts when the final
/// transcript is assembled.
pub fn is_boilerplate_chunk(text: &str) -> bool {
    let trimmed = text.trim();
    if matches!(trimmed, "[silence]" | "[inaudible]" | "[unclear]" | "") {
        return true;
    }
    let lowered = trimmed.to_lowercase();
    REFUSAL_MARKERS.iter().any(|m| lowered.contains(m))
        || REFUSAL_PREAMBLES.iter().any(|p| lowered.starts_with(p))
}
