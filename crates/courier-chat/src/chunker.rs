//! Splits rendered text into size-bounded, fence-safe chunks.

const FENCE: &str = "```";
const MIN_CHUNK_CHARS: usize = 16;

/// Splits `text` into chunks of at most `max_chars` characters, preferring
/// paragraph, then line, then word boundaries, with a hard cut as the last
/// resort.
///
/// A split that would land inside an unbalanced fenced code block backs up
/// to before the fence opens; when an entire window sits inside one fenced
/// block, the fence is closed at the cut and reopened in the next chunk
/// (which may exceed the limit by the synthesized fence marker). Every
/// emitted chunk therefore contains an even number of fence markers.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(MIN_CHUNK_CHARS);
    let mut chunks = Vec::new();
    let mut rest = text.to_string();
    loop {
        let trimmed = rest.trim();
        if trimmed.chars().count() <= max_chars {
            if !trimmed.is_empty() {
                chunks.push(trimmed.to_string());
            }
            return chunks;
        }
        let (chunk, remainder) = split_once_bounded(&rest, max_chars);
        if !chunk.trim().is_empty() {
            chunks.push(chunk);
        }
        rest = remainder;
    }
}

fn split_once_bounded(text: &str, max_chars: usize) -> (String, String) {
    let window_end = char_boundary_offset(text, max_chars);
    let mut split = pick_boundary(&text[..window_end], window_end);
    let candidate = &text[..split];
    if fence_count(candidate) % 2 == 1 {
        match candidate.rfind(FENCE) {
            Some(position) if position > 0 => split = position,
            _ => {
                // The whole window sits inside one fenced block. Cut at the
                // last line break past the fence header (hard cut if the
                // first body line alone overflows), close the fence here and
                // reopen it in the remainder.
                let header_end = text.find('\n').map(|position| position + 1).unwrap_or(0);
                let body_split = text[..window_end]
                    .rfind('\n')
                    .filter(|position| *position > header_end)
                    .unwrap_or(window_end);
                let chunk = format!("{}\n{FENCE}", text[..body_split].trim_end());
                let remainder =
                    format!("{FENCE}\n{}", text[body_split..].trim_start_matches('\n'));
                return (chunk, remainder);
            }
        }
    }
    let remainder = strip_boundary_separator(&text[split..]);
    (text[..split].trim_end().to_string(), remainder)
}

fn pick_boundary(window: &str, window_end: usize) -> usize {
    if let Some(position) = window.rfind("\n\n").filter(|position| *position > 0) {
        return position;
    }
    if let Some(position) = window.rfind('\n').filter(|position| *position > 0) {
        return position;
    }
    if let Some(position) = window.rfind(' ').filter(|position| *position > 0) {
        return position;
    }
    window_end
}

fn strip_boundary_separator(remainder: &str) -> String {
    if let Some(stripped) = remainder.strip_prefix("\n\n") {
        return stripped.to_string();
    }
    if let Some(stripped) = remainder.strip_prefix('\n') {
        return stripped.to_string();
    }
    if let Some(stripped) = remainder.strip_prefix(' ') {
        return stripped.to_string();
    }
    remainder.to_string()
}

fn char_boundary_offset(text: &str, max_chars: usize) -> usize {
    text.char_indices()
        .nth(max_chars)
        .map(|(offset, _)| offset)
        .unwrap_or(text.len())
}

fn fence_count(text: &str) -> usize {
    text.matches(FENCE).count()
}

#[cfg(test)]
mod tests {
    use super::{fence_count, split_into_chunks};

    #[test]
    fn unit_short_text_stays_in_one_chunk() {
        assert_eq!(split_into_chunks("hello world", 64), vec!["hello world"]);
        assert!(split_into_chunks("   ", 64).is_empty());
    }

    #[test]
    fn unit_split_prefers_paragraph_boundaries() {
        let text = format!("{}\n\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = split_into_chunks(&text, 40);
        assert_eq!(chunks, vec!["a".repeat(30), "b".repeat(30)]);
    }

    #[test]
    fn unit_split_falls_back_to_line_then_word_boundaries() {
        let text = format!("{}\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = split_into_chunks(&text, 40);
        assert_eq!(chunks, vec!["a".repeat(30), "b".repeat(30)]);

        let text = format!("{} {}", "a".repeat(30), "b".repeat(30));
        let chunks = split_into_chunks(&text, 40);
        assert_eq!(chunks, vec!["a".repeat(30), "b".repeat(30)]);
    }

    #[test]
    fn unit_unbroken_text_is_hard_split_on_char_boundaries() {
        let text = "é".repeat(50);
        let chunks = split_into_chunks(&text, 20);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].chars().count(), 20);
        assert_eq!(chunks.join(""), text);
    }

    #[test]
    fn unit_split_backs_up_before_an_unbalanced_fence() {
        let text = format!("intro text\n\n```\n{}\n```", "code ".repeat(10));
        let chunks = split_into_chunks(&text, 24);
        assert_eq!(chunks[0], "intro text");
        for chunk in &chunks {
            assert_eq!(fence_count(chunk) % 2, 0, "odd fences in {chunk:?}");
        }
    }

    #[test]
    fn unit_giant_fenced_block_is_closed_and_reopened() {
        let text = format!("```\n{}\n```", "let x = 1;\n".repeat(20));
        let chunks = split_into_chunks(&text, 64);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert_eq!(fence_count(chunk) % 2, 0, "odd fences in {chunk:?}");
            assert!(chunk.starts_with("```"));
            assert!(chunk.ends_with("```"));
        }
    }

    #[test]
    fn regression_every_chunk_has_even_fence_count_for_mixed_content() {
        let text = format!(
            "{}\n\n```\n{}\n```\n\n{}\n\n```rust\n{}\n```",
            "prose ".repeat(40),
            "fenced line\n".repeat(30),
            "more prose ".repeat(40),
            "fn main() {}\n".repeat(30)
        );
        for max_chars in [48, 96, 200, 500] {
            for chunk in split_into_chunks(&text, max_chars) {
                assert_eq!(
                    fence_count(&chunk) % 2,
                    0,
                    "odd fences at max_chars={max_chars} in {chunk:?}"
                );
            }
        }
    }
}
