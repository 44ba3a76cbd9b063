//! Audio mixing front-end
//!
//! Synthesis lives behind the [`AudioSink`] trait. The simulation talks to a
//! [`Mixer`], which enforces the voice ceiling, expires one-shot voices by
//! deadline and keeps working (silently) when no sink could be created.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::consts::ONE_SHOT_DURATION;

/// Oscillator shape
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveform {
    #[default]
    Sine,
    Square,
    Sawtooth,
    Triangle,
}

/// Identifies one voice in the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VoiceId(pub u64);

/// One-shot voices are allocated above every entity id
const ONE_SHOT_BASE: u64 = 1 << 32;

/// Parameters for starting a voice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceRequest {
    pub frequency: f32,
    pub waveform: Waveform,
    pub volume: f32,
    /// Short attack/decay instead of a sustained tone
    pub percussive: bool,
    /// Layer a slightly detuned second oscillator
    pub detuned: bool,
}

/// Partial update of a playing voice
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct VoiceUpdate {
    pub frequency: Option<f32>,
    pub waveform: Option<Waveform>,
    pub volume: Option<f32>,
}

/// Sound output collaborator
pub trait AudioSink {
    fn play(&mut self, voice: VoiceId, request: &VoiceRequest);
    fn update(&mut self, voice: VoiceId, update: &VoiceUpdate);
    fn stop(&mut self, voice: VoiceId);
    /// Global wet/dry reverb and ambient-pad intensity, 0 (dissonant) to 1 (harmonious)
    fn set_harmony_mix(&mut self, mix: f32);
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
}

/// Voice-limited mixer owned by the simulation
pub struct Mixer {
    sink: Option<Box<dyn AudioSink>>,
    max_voices: usize,
    master_volume: f32,
    active: BTreeSet<VoiceId>,
    /// (voice, stop deadline) for percussive/echo voices
    one_shots: Vec<(VoiceId, f64)>,
    next_one_shot: u64,
    harmony_mix: f32,
    rejected: u64,
    suspended: bool,
}

impl Mixer {
    pub fn new(sink: Box<dyn AudioSink>, max_voices: usize, master_volume: f32) -> Self {
        Self {
            sink: Some(sink),
            max_voices,
            master_volume: master_volume.clamp(0.0, 1.0),
            active: BTreeSet::new(),
            one_shots: Vec::new(),
            next_one_shot: ONE_SHOT_BASE,
            harmony_mix: 0.0,
            rejected: 0,
            suspended: false,
        }
    }

    /// Mixer without an output (audio initialization failed)
    ///
    /// Voice bookkeeping still runs so gameplay that depends on who is
    /// sounding behaves identically; nothing reaches a speaker.
    pub fn disabled(max_voices: usize) -> Self {
        log::warn!("No audio sink available - audio disabled");
        Self {
            sink: None,
            max_voices,
            master_volume: 0.0,
            active: BTreeSet::new(),
            one_shots: Vec::new(),
            next_one_shot: ONE_SHOT_BASE,
            harmony_mix: 0.0,
            rejected: 0,
            suspended: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn active_voices(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, voice: VoiceId) -> bool {
        self.active.contains(&voice)
    }

    /// Whether another voice would be accepted
    pub fn has_free_voice(&self) -> bool {
        self.active.len() < self.max_voices
    }

    /// Voices refused because the ceiling was reached
    pub fn rejected_voices(&self) -> u64 {
        self.rejected
    }

    pub fn harmony_mix(&self) -> f32 {
        self.harmony_mix
    }

    /// Applies to voices started or updated from now on
    pub fn set_master_volume(&mut self, vol: f32) {
        self.master_volume = vol.clamp(0.0, 1.0);
    }

    /// Start a voice. Returns false (and logs) when the voice ceiling is reached.
    ///
    /// Playing an id that is already sounding retunes it instead.
    pub fn play(&mut self, voice: VoiceId, request: &VoiceRequest) -> bool {
        if self.active.contains(&voice) {
            self.update(
                voice,
                &VoiceUpdate {
                    frequency: Some(request.frequency),
                    waveform: Some(request.waveform),
                    volume: Some(request.volume),
                },
            );
            return true;
        }
        if self.active.len() >= self.max_voices {
            self.rejected += 1;
            log::warn!("Max voice count ({}) reached, refusing {:?}", self.max_voices, voice);
            return false;
        }

        self.active.insert(voice);
        let volume = request.volume * self.master_volume;
        if let Some(sink) = &mut self.sink {
            sink.play(voice, &VoiceRequest { volume, ..*request });
        }
        true
    }

    /// Fire a short voice that stops itself after [`ONE_SHOT_DURATION`]
    pub fn play_one_shot(&mut self, request: &VoiceRequest, now: f64) -> Option<VoiceId> {
        let voice = VoiceId(self.next_one_shot);
        self.next_one_shot += 1;
        if !self.play(voice, &VoiceRequest { percussive: true, ..*request }) {
            return None;
        }
        self.one_shots.push((voice, now + ONE_SHOT_DURATION));
        Some(voice)
    }

    pub fn update(&mut self, voice: VoiceId, update: &VoiceUpdate) {
        if !self.active.contains(&voice) {
            return;
        }
        let update = VoiceUpdate {
            volume: update.volume.map(|v| v * self.master_volume),
            ..*update
        };
        if let Some(sink) = &mut self.sink {
            sink.update(voice, &update);
        }
    }

    pub fn stop(&mut self, voice: VoiceId) {
        if !self.active.remove(&voice) {
            return;
        }
        self.one_shots.retain(|(v, _)| *v != voice);
        if let Some(sink) = &mut self.sink {
            sink.stop(voice);
        }
    }

    pub fn stop_all(&mut self) {
        let voices: Vec<VoiceId> = self.active.iter().copied().collect();
        for voice in voices {
            self.stop(voice);
        }
        self.one_shots.clear();
    }

    /// Release one-shot voices whose deadline has passed
    pub fn expire(&mut self, now: f64) {
        let due: Vec<VoiceId> = self
            .one_shots
            .iter()
            .filter(|(_, deadline)| now >= *deadline)
            .map(|(v, _)| *v)
            .collect();
        for voice in due {
            self.stop(voice);
        }
    }

    pub fn set_harmony_mix(&mut self, mix: f32) {
        self.harmony_mix = mix.clamp(0.0, 1.0);
        if let Some(sink) = &mut self.sink {
            sink.set_harmony_mix(self.harmony_mix);
        }
    }

    pub fn suspend(&mut self) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        if let Some(sink) = &mut self.sink {
            sink.suspend();
        }
    }

    pub fn resume(&mut self) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        if let Some(sink) = &mut self.sink {
            sink.resume();
        }
    }
}

/// Recording sink for tests
#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkCall {
        Play(VoiceId, VoiceRequest),
        Update(VoiceId, VoiceUpdate),
        Stop(VoiceId),
        Mix(f32),
        Suspend,
        Resume,
    }

    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub calls: Rc<RefCell<Vec<SinkCall>>>,
    }

    impl RecordingSink {
        pub fn plays(&self) -> Vec<(VoiceId, VoiceRequest)> {
            self.calls
                .borrow()
                .iter()
                .filter_map(|c| match c {
                    SinkCall::Play(v, r) => Some((*v, *r)),
                    _ => None,
                })
                .collect()
        }

        pub fn last_mix(&self) -> Option<f32> {
            self.calls.borrow().iter().rev().find_map(|c| match c {
                SinkCall::Mix(m) => Some(*m),
                _ => None,
            })
        }
    }

    impl AudioSink for RecordingSink {
        fn play(&mut self, voice: VoiceId, request: &VoiceRequest) {
            self.calls.borrow_mut().push(SinkCall::Play(voice, *request));
        }
        fn update(&mut self, voice: VoiceId, update: &VoiceUpdate) {
            self.calls.borrow_mut().push(SinkCall::Update(voice, *update));
        }
        fn stop(&mut self, voice: VoiceId) {
            self.calls.borrow_mut().push(SinkCall::Stop(voice));
        }
        fn set_harmony_mix(&mut self, mix: f32) {
            self.calls.borrow_mut().push(SinkCall::Mix(mix));
        }
        fn suspend(&mut self) {
            self.calls.borrow_mut().push(SinkCall::Suspend);
        }
        fn resume(&mut self) {
            self.calls.borrow_mut().push(SinkCall::Resume);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn tone(freq: f32) -> VoiceRequest {
        VoiceRequest {
            frequency: freq,
            waveform: Waveform::Sine,
            volume: 0.5,
            percussive: false,
            detuned: false,
        }
    }

    #[test]
    fn test_voice_ceiling_refuses_without_panicking() {
        let sink = RecordingSink::default();
        let mut mixer = Mixer::new(Box::new(sink.clone()), 2, 1.0);
        assert!(mixer.play(VoiceId(1), &tone(440.0)));
        assert!(mixer.play(VoiceId(2), &tone(550.0)));
        assert!(!mixer.play(VoiceId(3), &tone(660.0)));
        assert_eq!(mixer.active_voices(), 2);
        assert_eq!(mixer.rejected_voices(), 1);
        assert_eq!(sink.plays().len(), 2);

        // Freeing a voice makes room again
        mixer.stop(VoiceId(1));
        assert!(mixer.play(VoiceId(3), &tone(660.0)));
    }

    #[test]
    fn test_replay_retunes_existing_voice() {
        let sink = RecordingSink::default();
        let mut mixer = Mixer::new(Box::new(sink.clone()), 4, 1.0);
        mixer.play(VoiceId(1), &tone(440.0));
        mixer.play(VoiceId(1), &tone(880.0));
        assert_eq!(mixer.active_voices(), 1);
        assert_eq!(sink.plays().len(), 1);
        assert!(matches!(
            sink.calls.borrow().last(),
            Some(SinkCall::Update(VoiceId(1), VoiceUpdate { frequency: Some(f), .. })) if *f == 880.0
        ));
    }

    #[test]
    fn test_one_shots_expire_by_deadline() {
        let sink = RecordingSink::default();
        let mut mixer = Mixer::new(Box::new(sink.clone()), 4, 1.0);
        let voice = mixer.play_one_shot(&tone(440.0), 1.0).unwrap();
        assert!(mixer.is_active(voice));
        assert!(sink.plays()[0].1.percussive);

        mixer.expire(1.1);
        assert!(mixer.is_active(voice));
        mixer.expire(1.0 + ONE_SHOT_DURATION);
        assert!(!mixer.is_active(voice));
    }

    #[test]
    fn test_master_volume_scales_voices() {
        let sink = RecordingSink::default();
        let mut mixer = Mixer::new(Box::new(sink.clone()), 4, 0.5);
        mixer.play(VoiceId(9), &tone(440.0));
        assert!((sink.plays()[0].1.volume - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_disabled_mixer_keeps_bookkeeping() {
        let mut mixer = Mixer::disabled(1);
        assert!(!mixer.is_enabled());
        assert!(mixer.play(VoiceId(1), &tone(440.0)));
        assert!(!mixer.play(VoiceId(2), &tone(440.0)));
        mixer.set_harmony_mix(2.0);
        assert_eq!(mixer.harmony_mix(), 1.0);
        mixer.stop_all();
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_suspend_resume_forwarded_once() {
        let sink = RecordingSink::default();
        let mut mixer = Mixer::new(Box::new(sink.clone()), 4, 1.0);
        mixer.suspend();
        mixer.suspend();
        mixer.resume();
        let calls = sink.calls.borrow();
        assert_eq!(
            calls.iter().filter(|c| **c == SinkCall::Suspend).count(),
            1
        );
        assert_eq!(calls.iter().filter(|c| **c == SinkCall::Resume).count(), 1);
    }
}
