//! Theater lighting through an Insteon PowerLinc Modem
//!
//! Playback changes and lighting keys map to fixed dimmer scenes. The
//! controller only decides levels; the frames go out through the lighting
//! writer, which spaces them by the configured command gap.

pub mod insteon;

use crate::config::{DimmerConfig, LightingConfig};
use crate::serial::DeviceJob;
use insteon::{set_level_frame, InsteonAddress};
use log::{debug, info, warn};

/// Fixed scenes from the level table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scene {
    Playing,
    Paused,
    Stopped,
    AllOn,
    AllDim,
}

/// Key-triggered lighting actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightingAction {
    AllOn,
    AllDim,
    Brighter,
    Dimmer,
}

/// Playback changes the controller reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackChange {
    Started,
    Stopped,
    Paused,
    Resumed,
}

/// Levels to set, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimmerJob {
    pub levels: Vec<(InsteonAddress, u8)>,
}

impl DeviceJob for DimmerJob {
    fn frames(&self) -> Vec<Vec<u8>> {
        self.levels
            .iter()
            .map(|(address, level)| set_level_frame(*address, *level))
            .collect()
    }

    /// Newer levels win per dimmer; dimmers only in the pending job keep
    /// their level so a scene is never half applied
    fn merge(mut self, newer: Self) -> Self {
        for (address, level) in newer.levels {
            match self.levels.iter_mut().find(|(a, _)| *a == address) {
                Some(entry) => entry.1 = level,
                None => self.levels.push((address, level)),
            }
        }
        self
    }
}

struct Dimmer {
    address: InsteonAddress,
    config: DimmerConfig,
    /// Last level we commanded; the PLM is never read back
    last_level: Option<u8>,
}

impl Dimmer {
    fn scene_level(&self, scene: Scene) -> u8 {
        match scene {
            Scene::Playing => self.config.playing,
            Scene::Paused => self.config.paused,
            Scene::Stopped => self.config.stopped,
            Scene::AllOn => self.config.all_on,
            Scene::AllDim => self.config.all_dim,
        }
    }
}

pub struct LightingController {
    dimmers: Vec<Dimmer>,
    step: u8,
    video_playing: bool,
}

impl LightingController {
    pub fn new(config: &LightingConfig) -> Self {
        let dimmers = config
            .dimmers
            .iter()
            .filter_map(|d| match InsteonAddress::parse(&d.address) {
                Some(address) => Some(Dimmer {
                    address,
                    config: d.clone(),
                    last_level: None,
                }),
                None => {
                    warn!("Skipping dimmer {} with bad address {}", d.name, d.address);
                    None
                }
            })
            .collect();

        Self {
            dimmers,
            step: config.step_percent,
            video_playing: false,
        }
    }

    /// Scene for a playback change. Stop, pause and resume only count after
    /// a start.
    pub fn on_playback(&mut self, change: PlaybackChange) -> Option<DimmerJob> {
        let scene = match change {
            PlaybackChange::Started => {
                self.video_playing = true;
                Scene::Playing
            }
            PlaybackChange::Stopped if self.video_playing => {
                self.video_playing = false;
                Scene::Stopped
            }
            PlaybackChange::Paused if self.video_playing => Scene::Paused,
            PlaybackChange::Resumed if self.video_playing => Scene::Playing,
            other => {
                debug!("Lighting ignores {:?} with no video playing", other);
                return None;
            }
        };

        info!("Lighting scene {:?} for playback {:?}", scene, change);
        self.scene(scene)
    }

    pub fn on_action(&mut self, action: LightingAction) -> Option<DimmerJob> {
        info!("Lighting request {:?}", action);
        match action {
            LightingAction::AllOn => self.scene(Scene::AllOn),
            LightingAction::AllDim => self.scene(Scene::AllDim),
            LightingAction::Brighter => self.adjust(i16::from(self.step)),
            LightingAction::Dimmer => self.adjust(-i16::from(self.step)),
        }
    }

    fn scene(&mut self, scene: Scene) -> Option<DimmerJob> {
        let levels: Vec<_> = self
            .dimmers
            .iter_mut()
            .map(|d| {
                let level = d.scene_level(scene);
                d.last_level = Some(level);
                (d.address, level)
            })
            .collect();

        if levels.is_empty() {
            None
        } else {
            Some(DimmerJob { levels })
        }
    }

    /// Step every dimmer from its last commanded level
    fn adjust(&mut self, delta: i16) -> Option<DimmerJob> {
        let mut levels = Vec::new();

        for d in &mut self.dimmers {
            let Some(current) = d.last_level else {
                debug!("No known level for {}, not adjusting", d.config.name);
                continue;
            };
            let target = (i16::from(current) + delta).clamp(0, 100) as u8;
            if target == current {
                debug!("{} already at {}", d.config.name, current);
                continue;
            }
            info!("Adjusting {} from {} to {}", d.config.name, current, target);
            d.last_level = Some(target);
            levels.push((d.address, target));
        }

        if levels.is_empty() {
            None
        } else {
            Some(DimmerJob { levels })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> LightingController {
        LightingController::new(&LightingConfig::default())
    }

    const POTS: InsteonAddress = InsteonAddress([0x42, 0x22, 0xB8]);
    const TRAY: InsteonAddress = InsteonAddress([0x42, 0x20, 0xF8]);

    #[test]
    fn test_playback_scenes() {
        let mut c = controller();

        let job = c.on_playback(PlaybackChange::Started).unwrap();
        assert_eq!(job.levels, vec![(POTS, 0), (TRAY, 30)]);

        let job = c.on_playback(PlaybackChange::Paused).unwrap();
        assert_eq!(job.levels, vec![(POTS, 20), (TRAY, 100)]);

        let job = c.on_playback(PlaybackChange::Resumed).unwrap();
        assert_eq!(job.levels, vec![(POTS, 0), (TRAY, 30)]);

        let job = c.on_playback(PlaybackChange::Stopped).unwrap();
        assert_eq!(job.levels, vec![(POTS, 0), (TRAY, 100)]);
        // Gate closed again
        assert!(c.on_playback(PlaybackChange::Paused).is_none());
    }

    #[test]
    fn test_stop_without_start_is_ignored() {
        let mut c = controller();
        assert!(c.on_playback(PlaybackChange::Stopped).is_none());
        assert!(c.on_playback(PlaybackChange::Paused).is_none());
        assert!(c.on_playback(PlaybackChange::Resumed).is_none());
    }

    #[test]
    fn test_keys_work_without_playback() {
        let mut c = controller();
        let job = c.on_action(LightingAction::AllOn).unwrap();
        assert_eq!(job.levels, vec![(POTS, 100), (TRAY, 100)]);

        let job = c.on_action(LightingAction::AllDim).unwrap();
        assert_eq!(job.levels, vec![(POTS, 0), (TRAY, 30)]);
    }

    #[test]
    fn test_brighter_and_dimmer_steps_clamp() {
        let mut c = controller();
        // Nothing known yet
        assert!(c.on_action(LightingAction::Brighter).is_none());

        c.on_action(LightingAction::AllDim);
        let job = c.on_action(LightingAction::Brighter).unwrap();
        assert_eq!(job.levels, vec![(POTS, 33), (TRAY, 63)]);

        let job = c.on_action(LightingAction::Brighter).unwrap();
        assert_eq!(job.levels, vec![(POTS, 66), (TRAY, 96)]);

        // Tray clamps at 100, then only Pots still moves
        let job = c.on_action(LightingAction::Brighter).unwrap();
        assert_eq!(job.levels, vec![(POTS, 99), (TRAY, 100)]);
        let job = c.on_action(LightingAction::Brighter).unwrap();
        assert_eq!(job.levels, vec![(POTS, 100)]);
        assert!(c.on_action(LightingAction::Brighter).is_none());

        let job = c.on_action(LightingAction::Dimmer).unwrap();
        assert_eq!(job.levels, vec![(POTS, 67), (TRAY, 67)]);
    }

    #[test]
    fn test_step_merged_into_pending_scene() {
        let mut c = controller();
        let scene = c.on_action(LightingAction::AllDim).unwrap();
        let step = c.on_action(LightingAction::Dimmer).unwrap();
        assert_eq!(step.levels, vec![(TRAY, 0)]);

        let merged = scene.merge(step);
        assert_eq!(merged.levels, vec![(POTS, 0), (TRAY, 0)]);
    }

    #[test]
    fn test_job_frames() {
        let job = DimmerJob {
            levels: vec![(POTS, 0), (TRAY, 100)],
        };
        let frames = job.frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0x02, 0x62, 0x42, 0x22, 0xB8, 0x0F, 0x13, 0]);
        assert_eq!(frames[1], vec![0x02, 0x62, 0x42, 0x20, 0xF8, 0x0F, 0x11, 255]);
    }
}
