//! Text queue feeding the speech sender
//!
//! A single-producer/single-consumer FIFO of characters. The dialogue
//! controller's reply streamer appends text as it arrives from the back
//! end; the speech sender pulls sentence-ish chunks sized for natural
//! synthesis. The splitter here is the authoritative sentence-boundary
//! ruleset; the reply streamer reuses it instead of carrying its own.

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Sentence-ending separators recognized by the splitter.
const SENTENCE_SEPARATORS: [char; 5] = ['.', '!', '?', ';', '…'];

/// Word-count bound before a chunk is forced out.
const MAX_WORDS: usize = 20;

/// Character bound before a chunk is forced out at a word boundary.
const MAX_CHARS: usize = 100;

/// Buffered text above this length means the session is audibly
/// speaking for barge-in purposes.
pub const MAX_CHARS_FOR_INTERRUPTIBLE_SPEECH: usize = 15;

/// Find the next chunk boundary in `text`.
///
/// Returns the byte index one past the boundary, applying in order
/// over the whole buffer:
/// 1. any of `. ! ? ; …`, or a newline followed by whitespace
/// 2. else 20 words
/// 3. else 100 characters, cut at the nearest word boundary at or
///    before
///
/// The word and character bounds apply only when no separator exists
/// anywhere in the buffer; a long sentence splits at its terminal
/// punctuation, never mid-sentence.
///
/// Returns `None` when the buffer should keep accumulating.
pub fn split_boundary(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if SENTENCE_SEPARATORS.contains(&c) {
            return Some(i + c.len_utf8());
        }
        if c == '\n' {
            if let Some(&(_, next)) = chars.peek() {
                if next.is_whitespace() {
                    return Some(i + 1);
                }
            }
        }
    }

    let mut char_count = 0usize;
    let mut word_count = 0usize;
    let mut in_word = false;
    let mut last_word_end: Option<usize> = None;
    let mut boundary_at_100: Option<usize> = None;

    for (i, c) in text.char_indices() {
        char_count += 1;

        if c.is_whitespace() {
            if in_word {
                word_count += 1;
                last_word_end = Some(i);
                if word_count >= MAX_WORDS {
                    return Some(i);
                }
            }
            in_word = false;
        } else {
            in_word = true;
        }

        if char_count == MAX_CHARS {
            boundary_at_100 = Some(last_word_end.unwrap_or(i + c.len_utf8()));
        }
    }

    if char_count >= MAX_CHARS {
        return boundary_at_100;
    }

    None
}

/// One speech-synthesis work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    /// Text content: a sentence or bounded fragment
    pub text: String,
    /// Ordinal index within the reply
    pub index: usize,
    /// Reply generation this chunk belongs to
    pub reply: u64,
    /// Whether this is the last chunk of the reply
    pub is_final: bool,
}

#[derive(Default)]
struct QueueState {
    buffer: String,
    /// Ordinal of the next chunk within the current reply
    next_index: usize,
    /// Reply generation, bumped on finish and on flush
    reply: u64,
    /// Set when the producer has no more text for this reply
    reply_finished: bool,
    /// Emitted the final marker for the finished reply
    final_emitted: bool,
    closed: bool,
}

/// Unbounded character FIFO with sentence-ish reads.
pub struct TextQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Default for TextQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TextQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Append text for the current reply. Returns false once closed.
    pub fn enqueue_text(&self, text: &str) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            // Text arriving after a finish starts the next reply.
            if state.reply_finished && state.final_emitted {
                state.reply_finished = false;
                state.final_emitted = false;
                state.reply += 1;
                state.next_index = 0;
            }
            state.buffer.push_str(text);
        }
        self.notify.notify_one();
        true
    }

    /// Mark the current reply as complete; the remaining buffer drains
    /// as the reply's last chunk.
    pub fn finish_reply(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.reply_finished = true;
        }
        self.notify.notify_one();
    }

    /// Empty the buffer without reading. The in-progress reply is
    /// abandoned; no final marker will be emitted for it.
    pub fn flush(&self) {
        {
            let mut state = self.state.lock();
            state.buffer.clear();
            state.reply_finished = false;
            state.final_emitted = false;
            state.reply += 1;
            state.next_index = 0;
        }
        self.notify.notify_one();
    }

    /// Close the queue; pending text is discarded and the consumer
    /// unblocks with `None`.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            state.closed = true;
            state.buffer.clear();
        }
        self.notify.notify_one();
    }

    /// Characters currently buffered.
    pub fn pending_chars(&self) -> usize {
        self.state.lock().buffer.chars().count()
    }

    /// Whether the buffered text alone is long enough to count as
    /// audible speech for barge-in decisions.
    pub fn holds_speech(&self) -> bool {
        self.pending_chars() > MAX_CHARS_FOR_INTERRUPTIBLE_SPEECH
    }

    /// Next chunk, blocking until text is available, the reply
    /// finishes, or the queue is closed.
    ///
    /// A finished reply with an empty remainder yields one empty chunk
    /// with `is_final` set so the consumer can emit its end-of-reply
    /// marker.
    pub async fn next_chunk(&self) -> Option<TextChunk> {
        loop {
            {
                let mut state = self.state.lock();
                if state.closed {
                    return None;
                }

                if let Some(boundary) = split_boundary(&state.buffer) {
                    return Some(Self::take_chunk(&mut state, boundary));
                }

                if state.reply_finished && !state.final_emitted {
                    let boundary = state.buffer.len();
                    return Some(Self::take_chunk(&mut state, boundary));
                }
            }
            self.notify.notified().await;
        }
    }

    fn take_chunk(state: &mut QueueState, boundary: usize) -> TextChunk {
        let rest = state.buffer.split_off(boundary);
        let text = std::mem::replace(&mut state.buffer, rest);
        let text = text.trim().to_string();

        let drained = state.buffer.trim().is_empty();
        let is_final = state.reply_finished && drained;
        if is_final {
            state.final_emitted = true;
        }

        let chunk = TextChunk {
            text,
            index: state.next_index,
            reply: state.reply,
            is_final,
        };
        state.next_index += 1;
        chunk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_split_on_separator() {
        let idx = split_boundary("Hello there. More text").unwrap();
        assert_eq!(&"Hello there. More text"[..idx], "Hello there.");
    }

    #[test]
    fn test_split_on_all_separators() {
        for sep in ['.', '!', '?', ';', '…'] {
            let text = format!("abc{sep} def");
            let idx = split_boundary(&text).unwrap();
            assert_eq!(&text[..idx], &format!("abc{sep}"));
        }
    }

    #[test]
    fn test_split_on_newline_followed_by_whitespace() {
        let text = "line one\n next line";
        let idx = split_boundary(text).unwrap();
        assert_eq!(&text[..idx], "line one\n");
    }

    #[test]
    fn test_newline_without_whitespace_does_not_split() {
        assert_eq!(split_boundary("ab\ncd"), None);
    }

    #[test]
    fn test_split_at_twenty_words() {
        let text = (0..30).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let idx = split_boundary(&text).unwrap();
        let prefix = &text[..idx];
        assert_eq!(prefix.split_whitespace().count(), 20);
    }

    #[test]
    fn test_separator_beats_word_count() {
        // A sentence past the word bound still splits at its terminal
        // punctuation, never mid-sentence.
        let words = (0..22).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ");
        let text = format!("{words}. And more");
        let idx = split_boundary(&text).unwrap();
        assert_eq!(&text[..idx], &format!("{words}."));
    }

    #[test]
    fn test_split_at_hundred_chars_on_word_boundary() {
        // Five long pseudo-words with no separators, > 100 chars total.
        let word = "a".repeat(24);
        let text = vec![word.clone(); 5].join(" ");
        assert!(text.chars().count() >= 100);
        let idx = split_boundary(&text).unwrap();
        let prefix = &text[..idx];
        assert!(prefix.chars().count() <= 100);
        assert!(prefix.ends_with(&word));
    }

    #[test]
    fn test_short_buffer_keeps_accumulating() {
        assert_eq!(split_boundary("just a few words"), None);
    }

    #[tokio::test]
    async fn test_queue_chunks_in_order() {
        let queue = TextQueue::new();
        queue.enqueue_text("First sentence. Second one! Tail without end");
        queue.finish_reply();

        let a = queue.next_chunk().await.unwrap();
        assert_eq!(a.text, "First sentence.");
        assert_eq!(a.index, 0);
        assert!(!a.is_final);

        let b = queue.next_chunk().await.unwrap();
        assert_eq!(b.text, "Second one!");
        assert_eq!(b.index, 1);

        let c = queue.next_chunk().await.unwrap();
        assert_eq!(c.text, "Tail without end");
        assert!(c.is_final);
    }

    #[tokio::test]
    async fn test_finish_with_empty_buffer_emits_final_marker() {
        let queue = TextQueue::new();
        queue.enqueue_text("Only sentence.");

        let a = queue.next_chunk().await.unwrap();
        assert_eq!(a.text, "Only sentence.");
        assert!(!a.is_final);

        queue.finish_reply();
        let marker = queue.next_chunk().await.unwrap();
        assert!(marker.text.is_empty());
        assert!(marker.is_final);
    }

    #[tokio::test]
    async fn test_flush_empties_buffer() {
        let queue = TextQueue::new();
        queue.enqueue_text("Some long text that was queued up. And more of it.");
        assert!(queue.holds_speech());
        queue.flush();
        assert_eq!(queue.pending_chars(), 0);
        assert!(!queue.holds_speech());
    }

    #[tokio::test]
    async fn test_close_unblocks_consumer() {
        let queue = Arc::new(TextQueue::new());
        let q = queue.clone();
        let reader = tokio::spawn(async move { q.next_chunk().await });
        tokio::task::yield_now().await;
        queue.close();
        assert!(reader.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reply_generation_bumps_after_finish() {
        let queue = TextQueue::new();
        queue.enqueue_text("One.");
        queue.finish_reply();
        let a = queue.next_chunk().await.unwrap();
        assert_eq!(a.reply, 0);
        assert!(a.is_final);

        queue.enqueue_text("Two.");
        queue.finish_reply();
        let b = queue.next_chunk().await.unwrap();
        assert_eq!(b.reply, 1);
        assert_eq!(b.index, 0);
    }

    #[tokio::test]
    async fn test_blocks_until_enqueue() {
        let queue = Arc::new(TextQueue::new());
        let q = queue.clone();
        let reader = tokio::spawn(async move { q.next_chunk().await });
        tokio::task::yield_now().await;
        queue.enqueue_text("Now a full sentence.");
        let chunk = reader.await.unwrap().unwrap();
        assert_eq!(chunk.text, "Now a full sentence.");
    }
}
