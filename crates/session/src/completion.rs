//! Turn completion detection
//!
//! A turn finishes when audio playback has ended, the transcript is final
//! and the upstream response-complete message has arrived, in any order,
//! evaluated on every update and never on a timer. The detector also hands
//! out the deadline for the bounded fallback that forces a stuck turn
//! closed, and force-completes a turn that is superseded by a newer
//! response or cut off by session teardown. Each turn completes exactly
//! once no matter which path gets there first.

use colloquy_core::{Turn, TurnCompletion};
use std::time::Duration;
use tokio::time::Instant;

/// One of the three signals whose conjunction finishes a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionSignal {
    AudioEnded,
    TranscriptFinalized,
    UpstreamCompleted,
}

/// Outcome of [`CompletionDetector::finalize_transcript`].
#[derive(Debug)]
pub enum FinalizeResult {
    /// Transcript recorded; the turn is still waiting on other signals
    Finalized,
    /// The final transcript was the last missing signal
    FinalizedAndCompleted(Turn),
    /// Unknown response id, no current turn, or the turn already finished
    Stale,
}

#[derive(Debug)]
struct TurnState {
    turn: Turn,
    last_signal_at: Instant,
}

/// Tracks the current assistant turn and decides when it is finished.
///
/// Lives inside the session state lock; every method is synchronous and
/// non-blocking. A completed turn stays readable (for state snapshots)
/// until the next turn begins or the session closes.
#[derive(Debug, Default)]
pub struct CompletionDetector {
    current: Option<TurnState>,
}

impl CompletionDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a new response.
    ///
    /// If the previous turn never finished, it is force-completed as
    /// superseded and returned so the caller can emit its final event.
    /// Turns are never silently dropped.
    pub fn begin_turn(&mut self, response_id: impl Into<String>) -> Option<Turn> {
        let superseded = match self.current.take() {
            Some(state) if !state.turn.is_complete() => {
                let mut turn = state.turn;
                turn.completion = Some(TurnCompletion::Superseded);
                Some(turn)
            }
            _ => None,
        };

        self.current = Some(TurnState {
            turn: Turn::new(response_id),
            last_signal_at: Instant::now(),
        });
        superseded
    }

    /// Record one completion signal.
    ///
    /// Signals carrying a response id that does not match the current
    /// turn are ignored; a missing id applies to the current turn (the
    /// upstream omits it on some audio lifecycle messages). Returns the
    /// finished turn iff this signal was the last one missing.
    pub fn apply(&mut self, signal: CompletionSignal, response_id: Option<&str>) -> Option<Turn> {
        let state = self.current.as_mut()?;
        if state.turn.is_complete() {
            return None;
        }
        if let Some(id) = response_id {
            if id != state.turn.response_id {
                return None;
            }
        }

        match signal {
            CompletionSignal::AudioEnded => state.turn.audio_ended = true,
            CompletionSignal::TranscriptFinalized => state.turn.transcript_finalized = true,
            CompletionSignal::UpstreamCompleted => state.turn.upstream_completed = true,
        }
        state.last_signal_at = Instant::now();

        if state.turn.signals_met() {
            state.turn.completion = Some(TurnCompletion::Signals);
            Some(state.turn.clone())
        } else {
            None
        }
    }

    /// Append a transcript fragment to the current turn. Returns false
    /// for fragments that belong to no turn, a stale turn, or a turn
    /// that already finished.
    pub fn push_delta(&mut self, response_id: &str, delta: &str) -> bool {
        let state = match self.current.as_mut() {
            Some(state) if state.turn.response_id == response_id && !state.turn.is_complete() => {
                state
            }
            _ => return false,
        };
        state.turn.push_delta(delta);
        state.last_signal_at = Instant::now();
        true
    }

    /// Replace the accumulated transcript with the upstream's final text
    /// and record the transcript-finalized signal.
    pub fn finalize_transcript(&mut self, response_id: &str, text: String) -> FinalizeResult {
        let state = match self.current.as_mut() {
            Some(state) if state.turn.response_id == response_id && !state.turn.is_complete() => {
                state
            }
            _ => return FinalizeResult::Stale,
        };

        state.turn.transcript = text;
        state.turn.transcript_finalized = true;
        state.last_signal_at = Instant::now();

        if state.turn.signals_met() {
            state.turn.completion = Some(TurnCompletion::Signals);
            FinalizeResult::FinalizedAndCompleted(state.turn.clone())
        } else {
            FinalizeResult::Finalized
        }
    }

    /// Record that playback began. Informational only; not part of the
    /// completion conjunction.
    pub fn note_audio_started(&mut self, response_id: Option<&str>) {
        if let Some(state) = self.current.as_mut() {
            if response_id.is_none() || response_id == Some(state.turn.response_id.as_str()) {
                state.turn.audio_started = true;
                state.last_signal_at = Instant::now();
            }
        }
    }

    /// Force-complete a turn whose signals never conjunctively resolved.
    /// Returns the turn if one was actually open.
    pub fn force_fallback(&mut self) -> Option<Turn> {
        let state = self.current.as_mut()?;
        if state.turn.is_complete() {
            return None;
        }
        state.turn.completion = Some(TurnCompletion::FallbackTimeout);
        Some(state.turn.clone())
    }

    /// Drop the current turn at session teardown. Returns it iff it was
    /// still open, marked completed-by-session-close.
    pub fn close(&mut self) -> Option<Turn> {
        let state = self.current.take()?;
        if state.turn.is_complete() {
            return None;
        }
        let mut turn = state.turn;
        turn.completion = Some(TurnCompletion::SessionClosed);
        Some(turn)
    }

    /// When the fallback should fire: `window` after the most recent
    /// signal for the current turn. None when no turn is open.
    pub fn deadline(&self, window: Duration) -> Option<Instant> {
        let state = self.current.as_ref()?;
        if state.turn.is_complete() {
            return None;
        }
        Some(state.last_signal_at + window)
    }

    /// The turn currently tracked, finished or not.
    pub fn current(&self) -> Option<&Turn> {
        self.current.as_ref().map(|state| &state.turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_on_last_signal_any_order() {
        // Two permutations that tripped the timer-based predecessor:
        // audio last, and upstream-complete last.
        let orders = [
            [
                CompletionSignal::TranscriptFinalized,
                CompletionSignal::UpstreamCompleted,
                CompletionSignal::AudioEnded,
            ],
            [
                CompletionSignal::AudioEnded,
                CompletionSignal::TranscriptFinalized,
                CompletionSignal::UpstreamCompleted,
            ],
        ];

        for order in orders {
            let mut detector = CompletionDetector::new();
            detector.begin_turn("resp_1");

            assert!(detector.apply(order[0], Some("resp_1")).is_none());
            assert!(detector.apply(order[1], Some("resp_1")).is_none());

            let done = detector.apply(order[2], Some("resp_1"));
            let turn = done.unwrap();
            assert_eq!(turn.completion, Some(TurnCompletion::Signals));
        }
    }

    #[test]
    fn test_completion_fires_exactly_once() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_1");
        detector.apply(CompletionSignal::AudioEnded, Some("resp_1"));
        detector.apply(CompletionSignal::TranscriptFinalized, Some("resp_1"));
        assert!(detector
            .apply(CompletionSignal::UpstreamCompleted, Some("resp_1"))
            .is_some());

        // Duplicate signals after completion are no-ops.
        assert!(detector
            .apply(CompletionSignal::UpstreamCompleted, Some("resp_1"))
            .is_none());
        assert!(detector
            .apply(CompletionSignal::AudioEnded, Some("resp_1"))
            .is_none());
        assert!(detector.force_fallback().is_none());
        assert!(detector.close().is_none());
    }

    #[test]
    fn test_stale_response_ids_are_ignored() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_2");

        assert!(detector
            .apply(CompletionSignal::AudioEnded, Some("resp_1"))
            .is_none());
        assert!(!detector.push_delta("resp_1", "late delta"));
        assert!(matches!(
            detector.finalize_transcript("resp_1", "late".to_string()),
            FinalizeResult::Stale
        ));

        let current = detector.current().unwrap();
        assert!(!current.audio_ended);
        assert_eq!(current.transcript, "");
    }

    #[test]
    fn test_audio_signal_without_id_applies_to_current_turn() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_1");

        detector.apply(CompletionSignal::AudioEnded, None);
        assert!(detector.current().unwrap().audio_ended);
    }

    #[test]
    fn test_new_turn_supersedes_incomplete_previous() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_1");
        detector.push_delta("resp_1", "half an answ");

        let superseded = detector.begin_turn("resp_2").unwrap();
        assert_eq!(superseded.response_id, "resp_1");
        assert_eq!(superseded.completion, Some(TurnCompletion::Superseded));
        assert_eq!(superseded.transcript, "half an answ");

        // The replaced-and-completed case produces nothing to report.
        detector.apply(CompletionSignal::AudioEnded, Some("resp_2"));
        detector.finalize_transcript("resp_2", "done".to_string());
        detector.apply(CompletionSignal::UpstreamCompleted, Some("resp_2"));
        assert!(detector.begin_turn("resp_3").is_none());
    }

    #[test]
    fn test_finalize_replaces_accumulated_deltas() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_1");
        detector.push_delta("resp_1", "¿Cómo");
        detector.push_delta("resp_1", " está");

        let result = detector.finalize_transcript("resp_1", "¿Cómo estás?".to_string());
        assert!(matches!(result, FinalizeResult::Finalized));
        assert_eq!(detector.current().unwrap().transcript, "¿Cómo estás?");
    }

    #[test]
    fn test_close_reports_open_turn_once() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_1");
        detector.apply(CompletionSignal::AudioEnded, Some("resp_1"));

        let closed = detector.close().unwrap();
        assert_eq!(closed.completion, Some(TurnCompletion::SessionClosed));
        assert!(detector.close().is_none());
        assert!(detector.current().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_last_signal() {
        let window = Duration::from_secs(9);
        let mut detector = CompletionDetector::new();

        assert!(detector.deadline(window).is_none());

        detector.begin_turn("resp_1");
        let first = detector.deadline(window).unwrap();

        tokio::time::advance(Duration::from_secs(3)).await;
        detector.push_delta("resp_1", "still talking");
        let pushed = detector.deadline(window).unwrap();
        assert_eq!(pushed.duration_since(first), Duration::from_secs(3));

        // A finished turn needs no fallback.
        detector.apply(CompletionSignal::AudioEnded, Some("resp_1"));
        detector.finalize_transcript("resp_1", "still talking".to_string());
        detector.apply(CompletionSignal::UpstreamCompleted, Some("resp_1"));
        assert!(detector.deadline(window).is_none());
    }

    #[test]
    fn test_fallback_marks_turn() {
        let mut detector = CompletionDetector::new();
        detector.begin_turn("resp_1");
        detector.apply(CompletionSignal::TranscriptFinalized, Some("resp_1"));
        detector.apply(CompletionSignal::UpstreamCompleted, Some("resp_1"));

        // audio-ended never arrives; the watchdog forces the turn closed
        let turn = detector.force_fallback().unwrap();
        assert_eq!(turn.completion, Some(TurnCompletion::FallbackTimeout));
        assert!(detector.force_fallback().is_none());
    }
}
