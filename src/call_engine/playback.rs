//! Playback Scheduler
//!
//! Plant dekodierte Puffer lückenlos und überlappungsfrei auf der monotonen
//! Uhr des Ausgabegeräts. Ein einziges Wasserzeichen (`next_start`) markiert
//! den frühesten Startzeitpunkt des nächsten Puffers.
//!
//! Alle Mutationen laufen im Call-Task (ein Callback-Turn nach dem anderen),
//! daher braucht der Scheduler keine Locks.

use super::pcm::AudioBuffer;
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// OUTPUT ABSTRACTION
// ============================================================================

/// Kennung einer geplanten Wiedergabe-Einheit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

/// Ausgabegerät mit eigener monotoner Uhr
///
/// Fertig abgespielte Einheiten meldet die Implementierung über den
/// Completion-Kanal, den sie beim Öffnen erhalten hat.
pub trait AudioOutput: Send {
    /// Aktuelle Position der Ausgabe-Uhr
    fn now(&self) -> Duration;

    /// Startet einen Puffer exakt zum Zeitpunkt `at`
    fn start(&mut self, id: UnitId, buffer: AudioBuffer, at: Duration);

    /// Stoppt eine geplante oder laufende Einheit sofort
    fn stop(&mut self, id: UnitId);

    /// Gibt das Gerät frei
    fn close(&mut self);
}

impl<T: AudioOutput + ?Sized> AudioOutput for Box<T> {
    fn now(&self) -> Duration {
        (**self).now()
    }

    fn start(&mut self, id: UnitId, buffer: AudioBuffer, at: Duration) {
        (**self).start(id, buffer, at)
    }

    fn stop(&mut self, id: UnitId) {
        (**self).stop(id)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

// ============================================================================
// PLAYBACK UNIT
// ============================================================================

/// Eine geplante Wiedergabe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub start: Duration,
    pub duration: Duration,
}

impl PlaybackUnit {
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }
}

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct PlaybackScheduler<O: AudioOutput> {
    output: O,
    next_start: Duration,
    active: HashMap<UnitId, PlaybackUnit>,
    next_id: u64,
    closed: bool,
}

impl<O: AudioOutput> PlaybackScheduler<O> {
    /// Erstellt den Scheduler, Wasserzeichen = aktuelle Uhrzeit des Geräts
    pub fn new(output: O) -> Self {
        let next_start = output.now();
        Self {
            output,
            next_start,
            active: HashMap::new(),
            next_id: 0,
            closed: false,
        }
    }

    /// Plant einen Puffer direkt hinter dem vorherigen
    ///
    /// Kommt der Puffer zu spät, startet er sofort; nie vor `now`.
    pub fn schedule(&mut self, buffer: AudioBuffer) -> Option<PlaybackUnit> {
        if self.closed || buffer.is_empty() {
            return None;
        }

        let now = self.output.now();
        self.next_start = self.next_start.max(now);

        let unit = PlaybackUnit {
            id: UnitId(self.next_id),
            start: self.next_start,
            duration: buffer.duration(),
        };
        self.next_id += 1;

        self.output.start(unit.id, buffer, unit.start);
        self.next_start += unit.duration;
        self.active.insert(unit.id, unit);

        tracing::trace!(
            "Scheduled unit {} at {:?} for {:?} (watermark {:?})",
            unit.id.0,
            unit.start,
            unit.duration,
            self.next_start
        );
        Some(unit)
    }

    /// Completion-Callback: Einheit ist fertig abgespielt
    pub fn on_unit_ended(&mut self, id: UnitId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Barge-in: alles stoppen, Wasserzeichen auf die aktuelle Uhrzeit
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.next_start = self.output.now();
        tracing::debug!(
            "Playback interrupted, {} unit(s) stopped, watermark reset to {:?}",
            stopped,
            self.next_start
        );
        stopped
    }

    /// Abbau: alles stoppen und das Ausgabegerät freigeben
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        let stopped = self.stop_all();
        self.output.close();
        self.closed = true;
        tracing::debug!("Playback closed, {} unit(s) stopped", stopped);
    }

    pub fn next_start(&self) -> Duration {
        self.next_start
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: UnitId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn stop_all(&mut self) -> usize {
        let count = self.active.len();
        for (id, _) in self.active.drain() {
            self.output.stop(id);
        }
        count
    }
}

impl<O: AudioOutput> Drop for PlaybackScheduler<O> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ManualOutput;
    use proptest::prelude::*;

    const RATE: u32 = 24_000;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn buffer_ms(value: u64) -> AudioBuffer {
        AudioBuffer::silence(RATE, (RATE as u64 * value / 1000) as usize)
    }

    #[test]
    fn watermark_starts_at_clock_time() {
        let output = ManualOutput::new();
        output.clock().set(ms(1234));
        let scheduler = PlaybackScheduler::new(output);
        assert_eq!(scheduler.next_start(), ms(1234));
    }

    #[test]
    fn timely_buffers_play_back_to_back() {
        let output = ManualOutput::new();
        let clock = output.clock();
        let mut scheduler = PlaybackScheduler::new(output);

        let first = scheduler.schedule(buffer_ms(200)).unwrap();
        clock.set(ms(50));
        let second = scheduler.schedule(buffer_ms(120)).unwrap();
        clock.set(ms(100));
        let third = scheduler.schedule(buffer_ms(80)).unwrap();

        assert_eq!(first.start, ms(0));
        assert_eq!(second.start, first.end());
        assert_eq!(third.start, second.end());
        assert_eq!(scheduler.next_start(), ms(400));
    }

    #[test]
    fn late_buffer_starts_now() {
        let output = ManualOutput::new();
        let clock = output.clock();
        let mut scheduler = PlaybackScheduler::new(output);

        scheduler.schedule(buffer_ms(100)).unwrap();
        clock.set(ms(300));
        let late = scheduler.schedule(buffer_ms(100)).unwrap();
        assert_eq!(late.start, ms(300));
    }

    #[test]
    fn reference_scenario_with_barge_in() {
        let output = ManualOutput::new();
        let clock = output.clock();
        let log = output.log();
        let mut scheduler = PlaybackScheduler::new(output);

        let a = scheduler.schedule(buffer_ms(200)).unwrap();
        clock.set(ms(150));
        let b = scheduler.schedule(buffer_ms(200)).unwrap();
        clock.set(ms(500));
        let c = scheduler.schedule(buffer_ms(200)).unwrap();

        assert_eq!(a.start, ms(0));
        assert_eq!(b.start, ms(200));
        assert_eq!(c.start, ms(500));

        clock.set(ms(550));
        assert_eq!(scheduler.interrupt(), 3);
        assert_eq!(scheduler.active_count(), 0);
        assert_eq!(scheduler.next_start(), ms(550));

        let mut stopped = log.lock().stopped.clone();
        stopped.sort();
        assert_eq!(stopped, vec![a.id, b.id, c.id]);

        // Nach dem Interrupt nie am alten Wasserzeichen
        let next = scheduler.schedule(buffer_ms(200)).unwrap();
        assert_eq!(next.start, ms(550));
    }

    #[test]
    fn completion_removes_unit() {
        let output = ManualOutput::new();
        let mut scheduler = PlaybackScheduler::new(output);

        let unit = scheduler.schedule(buffer_ms(20)).unwrap();
        assert!(scheduler.is_active(unit.id));
        assert!(scheduler.on_unit_ended(unit.id));
        assert!(!scheduler.is_active(unit.id));
        assert!(!scheduler.on_unit_ended(unit.id));
    }

    #[test]
    fn close_stops_everything_and_releases_output() {
        let output = ManualOutput::new();
        let log = output.log();
        let mut scheduler = PlaybackScheduler::new(output);

        scheduler.schedule(buffer_ms(200)).unwrap();
        scheduler.schedule(buffer_ms(200)).unwrap();
        scheduler.close();

        assert_eq!(scheduler.active_count(), 0);
        assert!(scheduler.is_closed());
        assert!(log.lock().closed);
        assert_eq!(log.lock().stopped.len(), 2);

        // Nach dem Schließen wird nichts mehr geplant
        assert!(scheduler.schedule(buffer_ms(200)).is_none());
    }

    #[test]
    fn drop_releases_output() {
        let output = ManualOutput::new();
        let log = output.log();
        {
            let mut scheduler = PlaybackScheduler::new(output);
            scheduler.schedule(buffer_ms(200)).unwrap();
        }
        assert!(log.lock().closed);
        assert_eq!(log.lock().stopped.len(), 1);
    }

    #[test]
    fn empty_buffer_is_ignored() {
        let mut scheduler = PlaybackScheduler::new(ManualOutput::new());
        assert!(scheduler.schedule(AudioBuffer::mono(RATE, vec![])).is_none());
        assert_eq!(scheduler.next_start(), Duration::ZERO);
    }

    proptest! {
        #[test]
        fn units_never_overlap(
            steps in proptest::collection::vec((0u64..400, 1u64..300), 1..40)
        ) {
            let output = ManualOutput::new();
            let clock = output.clock();
            let mut scheduler = PlaybackScheduler::new(output);
            let mut now = Duration::ZERO;
            let mut previous: Option<PlaybackUnit> = None;

            for (gap, length) in steps {
                now += ms(gap);
                clock.set(now);
                let unit = scheduler.schedule(buffer_ms(length)).unwrap();

                prop_assert!(unit.start >= now);
                if let Some(prev) = previous {
                    prop_assert!(unit.start >= prev.end());
                    if now <= prev.end() {
                        prop_assert_eq!(unit.start, prev.end());
                    }
                }
                previous = Some(unit);
            }
        }
    }
}
