//! Aspect-ratio engine
//!
//! Decides which lens preset the projector should be on. The engine is a
//! plain state machine: every input returns the commands it produced and
//! the event loop carries them out. It never touches a port or the network
//! itself.
//!
//! Ratio precedence for a title, highest first:
//!
//! 1. a user override from the store
//! 2. a metadata lookup (cached or fresh)
//! 3. the ratio the player reported
//!
//! The player ratio is applied provisionally while a lookup is running and
//! replaced if the lookup comes back with something different.

use crate::aspect::{AspectRatio, LensCommand, LensMap};
use crate::config::ProjectorConfig;
use crate::dispatch::TriggerAction;
use crate::metadata::{Lookup, MetadataResolver};
use crate::overrides::OverrideStore;
use crate::title::{Title, TitleKey};
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Nothing playing
    Idle,
    /// Title playing, lookup outstanding
    Resolving,
    /// Title playing, ratio settled
    Locked,
    /// Override menu is open
    Overriding,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EngineState::Idle => "idle",
            EngineState::Resolving => "resolving",
            EngineState::Locked => "locked",
            EngineState::Overriding => "overriding",
        };
        f.write_str(name)
    }
}

/// Where the session's ratio came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatioSource {
    Override,
    Metadata,
    Player,
    Menu,
}

/// Menu the host should put on screen
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MenuRequest {
    pub menu: &'static str,
    pub title: String,
    pub choices: Vec<AspectRatio>,
}

/// Work the engine hands to the event loop
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Lens {
        ratio: AspectRatio,
        command: LensCommand,
    },
    Lookup(Title),
    ShowMenu(MenuRequest),
}

#[derive(Debug)]
struct Session {
    title: Title,
    player_ratio: Option<AspectRatio>,
    ratio: Option<AspectRatio>,
    source: Option<RatioSource>,
    /// Set by a set-2.35 / set-1.85 key; outranks everything for this title
    forced: Option<AspectRatio>,
    /// Ratio most recently sent for this title
    applied: Option<AspectRatio>,
    paused: bool,
}

impl Session {
    fn new(title: Title, player_ratio: Option<AspectRatio>) -> Self {
        Self {
            title,
            player_ratio,
            ratio: None,
            source: None,
            forced: None,
            applied: None,
            paused: false,
        }
    }

    fn effective(&self) -> Option<AspectRatio> {
        self.forced.or(self.ratio)
    }

    /// Overrides and menu picks are never replaced by a lookup
    fn pinned(&self) -> bool {
        matches!(self.source, Some(RatioSource::Override | RatioSource::Menu))
    }
}

pub struct Engine {
    state: EngineState,
    session: Option<Session>,
    /// State to go back to when the menu is cancelled
    menu_return: EngineState,
    lens: LensMap,
    home_ratio: AspectRatio,
    restore_on_pause: bool,
    restore_on_stop: bool,
    overrides: OverrideStore,
    resolver: Arc<MetadataResolver>,
}

impl Engine {
    pub fn new(
        config: &ProjectorConfig,
        overrides: OverrideStore,
        resolver: Arc<MetadataResolver>,
    ) -> Self {
        Self {
            state: EngineState::Idle,
            session: None,
            menu_return: EngineState::Idle,
            lens: config.lens.clone(),
            home_ratio: config.home_ratio,
            restore_on_pause: config.restore_on_pause,
            restore_on_stop: config.restore_on_stop,
            overrides,
            resolver,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Key of the title playing now
    pub fn active_title(&self) -> Option<&TitleKey> {
        self.session.as_ref().map(|s| &s.title.key)
    }

    /// Ratio currently wanted for the playing title
    pub fn current_ratio(&self) -> Option<AspectRatio> {
        self.session.as_ref().and_then(Session::effective)
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state != state {
            debug!("Engine {} -> {}", self.state, state);
            self.state = state;
        }
    }

    fn lens_command(&self, ratio: AspectRatio) -> Option<Command> {
        match self.lens.command_for(ratio) {
            Some(command) => {
                info!("Lens {} for ratio {}", command.slot, ratio);
                Some(Command::Lens { ratio, command })
            }
            None => {
                debug!("No lens preset for ratio {}", ratio);
                None
            }
        }
    }

    /// Send the session's ratio if it is not what was last sent for it
    fn apply_session(&mut self) -> Vec<Command> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let Some(ratio) = session.effective() else {
            return Vec::new();
        };
        if session.applied == Some(ratio) {
            debug!("{} already applied for {}", ratio, session.title);
            return Vec::new();
        }
        if session.paused && self.restore_on_pause {
            debug!("Paused at home ratio; {} applies on resume", ratio);
            return Vec::new();
        }

        let command = self.lens_command(ratio);
        if let Some(session) = self.session.as_mut() {
            session.applied = Some(ratio);
        }
        command.into_iter().collect()
    }

    fn override_for(&self, key: &TitleKey) -> Option<AspectRatio> {
        match self.overrides.get(key) {
            Ok(ratio) => ratio.filter(AspectRatio::is_known),
            Err(e) => {
                warn!("Ignoring override store: {}", e);
                None
            }
        }
    }

    /// Playback of a title started (or a new title replaced the old one)
    pub fn on_started(&mut self, title: Title, player_ratio: Option<AspectRatio>) -> Vec<Command> {
        info!(
            "Playing {} [{}], player ratio {}",
            title,
            title.key,
            player_ratio.unwrap_or(AspectRatio::Unknown)
        );
        let player_ratio = player_ratio.filter(AspectRatio::is_known);
        let key = title.key.clone();
        self.session = Some(Session::new(title, player_ratio));
        self.set_state(EngineState::Resolving);

        let mut commands = Vec::new();
        let (ratio, source) = if let Some(ratio) = self.override_for(&key) {
            info!("Override for {}: {}", key, ratio);
            (Some(ratio), Some(RatioSource::Override))
        } else if let Some(lookup) = self.resolver.cached(&key) {
            match lookup {
                Lookup::Found(ratio) => (Some(ratio), Some(RatioSource::Metadata)),
                Lookup::NotFound => (player_ratio, player_ratio.map(|_| RatioSource::Player)),
            }
        } else {
            let session = self.session.as_ref().map(|s| &s.title);
            if let Some(title) = session.filter(|t| self.resolver.is_queryable(t)) {
                commands.push(Command::Lookup(title.clone()));
                if let Some(session) = self.session.as_mut() {
                    session.ratio = session.player_ratio;
                    session.source = session.player_ratio.map(|_| RatioSource::Player);
                }
                commands.extend(self.apply_session());
                return commands;
            }
            (player_ratio, player_ratio.map(|_| RatioSource::Player))
        };

        if let Some(session) = self.session.as_mut() {
            session.ratio = ratio;
            session.source = source;
        }
        self.set_state(EngineState::Locked);
        commands.extend(self.apply_session());
        commands
    }

    /// A lookup finished
    pub fn on_resolved(&mut self, key: &TitleKey, lookup: Lookup) -> Vec<Command> {
        let Some(session) = self.session.as_mut() else {
            debug!("Discarding lookup for {}: nothing playing", key);
            return Vec::new();
        };
        if &session.title.key != key {
            debug!("Discarding late lookup for {}", key);
            return Vec::new();
        }
        if session.pinned() {
            debug!("Lookup for {} ignored: user override in effect", key);
            if self.state == EngineState::Resolving {
                self.set_state(EngineState::Locked);
            }
            return Vec::new();
        }

        match lookup {
            Lookup::Found(ratio) => {
                session.ratio = Some(ratio);
                session.source = Some(RatioSource::Metadata);
            }
            Lookup::NotFound => {
                debug!("No metadata ratio for {}; keeping player ratio", key);
                session.ratio = session.player_ratio;
                session.source = session.player_ratio.map(|_| RatioSource::Player);
            }
        }
        if session.forced.is_some() {
            info!("Lookup for {} recorded; forced ratio stays", key);
        }

        match self.state {
            EngineState::Resolving => self.set_state(EngineState::Locked),
            EngineState::Overriding => self.menu_return = EngineState::Locked,
            _ => {}
        }
        self.apply_session()
    }

    pub fn on_paused(&mut self) -> Vec<Command> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if session.paused {
            return Vec::new();
        }
        session.paused = true;

        if !self.restore_on_pause {
            return Vec::new();
        }
        let home = self.home_ratio;
        session.applied = Some(home);
        info!("Paused: restoring home ratio {}", home);
        self.lens_command(home).into_iter().collect()
    }

    pub fn on_resumed(&mut self) -> Vec<Command> {
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };
        if !session.paused {
            return Vec::new();
        }
        session.paused = false;
        self.apply_session()
    }

    /// Playback stopped or ended
    pub fn on_stopped(&mut self) -> Vec<Command> {
        let was_playing = self.session.take().is_some();
        self.set_state(EngineState::Idle);
        self.menu_return = EngineState::Idle;

        if was_playing && self.restore_on_stop {
            info!("Stopped: restoring home ratio {}", self.home_ratio);
            return self.lens_command(self.home_ratio).into_iter().collect();
        }
        Vec::new()
    }

    pub fn on_trigger(&mut self, action: TriggerAction) -> Vec<Command> {
        match action {
            TriggerAction::SetScope => self.force(AspectRatio::Scope),
            TriggerAction::SetFlat => self.force(AspectRatio::Flat),
            TriggerAction::ShowMenu => self.show_menu(),
            TriggerAction::Lighting(_) => {
                debug!("Engine ignores {}", action);
                Vec::new()
            }
        }
    }

    /// Key-forced ratio: sent now, in any state
    fn force(&mut self, ratio: AspectRatio) -> Vec<Command> {
        info!("Forced ratio {} ({})", ratio, self.state);
        if let Some(session) = self.session.as_mut() {
            session.forced = Some(ratio);
            session.applied = Some(ratio);
        }
        self.lens_command(ratio).into_iter().collect()
    }

    fn show_menu(&mut self) -> Vec<Command> {
        let Some(session) = self.session.as_ref() else {
            debug!("Ignoring menu request: nothing playing");
            return Vec::new();
        };
        let request = MenuRequest {
            menu: "aspect-ratio",
            title: session.title.to_string(),
            choices: vec![AspectRatio::Flat, AspectRatio::Scope],
        };
        if self.state != EngineState::Overriding {
            self.menu_return = self.state;
            self.set_state(EngineState::Overriding);
        }
        vec![Command::ShowMenu(request)]
    }

    /// User picked a ratio from the menu: persist it and apply it now
    pub fn on_menu_selected(&mut self, ratio: AspectRatio) -> Vec<Command> {
        if self.state != EngineState::Overriding || !ratio.is_known() {
            debug!("Ignoring menu selection {} ({})", ratio, self.state);
            return Vec::new();
        }
        let Some(session) = self.session.as_mut() else {
            return Vec::new();
        };

        if let Err(e) = self.overrides.set(&session.title.key, ratio) {
            warn!("Override for {} not saved: {}", session.title.key, e);
        }
        session.ratio = Some(ratio);
        session.source = Some(RatioSource::Menu);
        session.forced = None;
        session.applied = Some(ratio);
        self.set_state(EngineState::Locked);

        self.lens_command(ratio).into_iter().collect()
    }

    pub fn on_menu_cancelled(&mut self) -> Vec<Command> {
        if self.state == EngineState::Overriding {
            debug!("Menu cancelled");
            let previous = self.menu_return;
            self.set_state(previous);
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetadataConfig;
    use crate::metadata::testing::ScriptedSource;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    struct Harness {
        engine: Engine,
        resolver: Arc<MetadataResolver>,
        store_path: std::path::PathBuf,
        _dir: TempDir,
    }

    fn harness_with(config: ProjectorConfig, source: ScriptedSource) -> Harness {
        let dir = tempdir().unwrap();
        let store_path = dir.path().join("overrides.toml");
        let resolver = Arc::new(MetadataResolver::new(
            Arc::new(source),
            &MetadataConfig::default(),
        ));
        let engine = Engine::new(
            &config,
            OverrideStore::new(&store_path),
            Arc::clone(&resolver),
        );
        Harness {
            engine,
            resolver,
            store_path,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(ProjectorConfig::default(), ScriptedSource::new(Duration::ZERO))
    }

    fn lens(ratio: AspectRatio) -> Command {
        Command::Lens {
            ratio,
            command: LensMap::default().command_for(ratio).unwrap(),
        }
    }

    fn lens_ratios(commands: &[Command]) -> Vec<AspectRatio> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::Lens { ratio, .. } => Some(*ratio),
                _ => None,
            })
            .collect()
    }

    fn lookups(commands: &[Command]) -> usize {
        commands
            .iter()
            .filter(|c| matches!(c, Command::Lookup(_)))
            .count()
    }

    fn movie_a() -> Title {
        Title::named("Movie A")
    }

    #[test]
    fn test_player_ratio_then_resolver_ratio() {
        let mut h = harness();

        let commands = h.engine.on_started(movie_a(), Some(AspectRatio::Flat));
        assert_eq!(commands, vec![Command::Lookup(movie_a()), lens(AspectRatio::Flat)]);
        assert_eq!(h.engine.state(), EngineState::Resolving);

        let commands = h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Scope));
        assert_eq!(commands, vec![lens(AspectRatio::Scope)]);
        assert_eq!(h.engine.state(), EngineState::Locked);
        assert_eq!(h.engine.current_ratio(), Some(AspectRatio::Scope));
    }

    #[test]
    fn test_resolver_agreeing_with_player_sends_nothing_more() {
        let mut h = harness();
        h.engine.on_started(movie_a(), Some(AspectRatio::Scope));
        let commands = h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Scope));
        assert!(commands.is_empty());
    }

    #[test]
    fn test_not_found_falls_back_to_player() {
        let mut h = harness();
        let commands = h.engine.on_started(movie_a(), None);
        assert_eq!(lens_ratios(&commands), vec![]);

        let commands = h.engine.on_resolved(&movie_a().key, Lookup::NotFound);
        assert!(commands.is_empty());
        assert_eq!(h.engine.state(), EngineState::Locked);
        assert_eq!(h.engine.current_ratio(), None);

        h.engine.on_stopped();
        h.engine.on_started(Title::named("Movie B"), Some(AspectRatio::Other(178)));
        let commands = h
            .engine
            .on_resolved(&Title::named("Movie B").key, Lookup::NotFound);
        assert!(commands.is_empty());
        assert_eq!(h.engine.current_ratio(), Some(AspectRatio::Other(178)));
    }

    #[test]
    fn test_override_beats_player_and_resolver() {
        let mut h = harness();
        OverrideStore::new(&h.store_path)
            .set(&movie_a().key, AspectRatio::Flat)
            .unwrap();

        let commands = h.engine.on_started(movie_a(), Some(AspectRatio::Scope));
        assert_eq!(commands, vec![lens(AspectRatio::Flat)]);
        assert_eq!(h.engine.state(), EngineState::Locked);

        // Even a stray lookup result does not move it
        let commands = h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Scope));
        assert!(commands.is_empty());
        assert_eq!(h.engine.current_ratio(), Some(AspectRatio::Flat));
    }

    #[test]
    fn test_late_lookup_for_previous_title_is_discarded() {
        let mut h = harness();
        h.engine.on_started(movie_a(), Some(AspectRatio::Flat));
        h.engine.on_started(Title::named("Movie B"), Some(AspectRatio::Flat));

        let commands = h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Scope));
        assert!(commands.is_empty());
        assert_eq!(h.engine.state(), EngineState::Resolving);

        h.engine.on_stopped();
        let commands = h
            .engine
            .on_resolved(&Title::named("Movie B").key, Lookup::Found(AspectRatio::Scope));
        assert!(commands.is_empty());
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_cached_lookup_skips_query() {
        let source = ScriptedSource::new(Duration::ZERO).answer("Movie A", Ok(Some(AspectRatio::Scope)));
        let mut h = harness_with(ProjectorConfig::default(), source);
        h.resolver.resolve(&movie_a()).await;

        let commands = h.engine.on_started(movie_a(), Some(AspectRatio::Flat));
        assert_eq!(commands, vec![lens(AspectRatio::Scope)]);
        assert_eq!(h.engine.state(), EngineState::Locked);
    }

    #[test]
    fn test_tv_show_uses_player_ratio_without_lookup() {
        let mut h = harness();
        let show = Title::new("Episode", None, None, Some(12));
        let commands = h.engine.on_started(show, Some(AspectRatio::Other(178)));
        assert_eq!(lookups(&commands), 0);
        assert_eq!(lens_ratios(&commands), vec![AspectRatio::Other(178)]);
        assert_eq!(h.engine.state(), EngineState::Locked);
    }

    #[test]
    fn test_forced_ratio_while_idle() {
        let mut h = harness();
        let commands = h.engine.on_trigger(TriggerAction::SetScope);
        assert_eq!(commands, vec![lens(AspectRatio::Scope)]);
        assert_eq!(h.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_forced_ratio_outlasts_lookup() {
        let mut h = harness();
        h.engine.on_started(movie_a(), Some(AspectRatio::Scope));

        let commands = h.engine.on_trigger(TriggerAction::SetFlat);
        assert_eq!(commands, vec![lens(AspectRatio::Flat)]);

        let commands = h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Scope));
        assert!(commands.is_empty());
        assert_eq!(h.engine.current_ratio(), Some(AspectRatio::Flat));
        // Forcing never writes an override
        assert_eq!(OverrideStore::new(&h.store_path).get(&movie_a().key).unwrap(), None);
    }

    #[test]
    fn test_menu_selection_persists_override() {
        let mut h = harness();
        h.engine.on_started(movie_a(), Some(AspectRatio::Flat));
        h.engine.on_resolved(&movie_a().key, Lookup::NotFound);

        let commands = h.engine.on_trigger(TriggerAction::ShowMenu);
        assert_eq!(
            commands,
            vec![Command::ShowMenu(MenuRequest {
                menu: "aspect-ratio",
                title: "Movie A".to_string(),
                choices: vec![AspectRatio::Flat, AspectRatio::Scope],
            })]
        );
        assert_eq!(h.engine.state(), EngineState::Overriding);

        let commands = h.engine.on_menu_selected(AspectRatio::Scope);
        assert_eq!(commands, vec![lens(AspectRatio::Scope)]);
        assert_eq!(h.engine.state(), EngineState::Locked);
        assert_eq!(
            OverrideStore::new(&h.store_path).get(&movie_a().key).unwrap(),
            Some(AspectRatio::Scope)
        );

        // Next time the title plays, the override applies with no lookup
        h.engine.on_stopped();
        let commands = h.engine.on_started(movie_a(), Some(AspectRatio::Flat));
        assert_eq!(commands, vec![lens(AspectRatio::Scope)]);
        assert_eq!(lookups(&commands), 0);
    }

    #[test]
    fn test_menu_cancel_and_idle_menu() {
        let mut h = harness();
        assert!(h.engine.on_trigger(TriggerAction::ShowMenu).is_empty());
        assert!(h.engine.on_menu_selected(AspectRatio::Scope).is_empty());

        h.engine.on_started(movie_a(), Some(AspectRatio::Flat));
        h.engine.on_trigger(TriggerAction::ShowMenu);
        assert_eq!(h.engine.state(), EngineState::Overriding);

        // Lookup lands while the menu is up
        let commands = h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Scope));
        assert_eq!(commands, vec![lens(AspectRatio::Scope)]);
        assert_eq!(h.engine.state(), EngineState::Overriding);

        h.engine.on_menu_cancelled();
        assert_eq!(h.engine.state(), EngineState::Locked);
        assert_eq!(OverrideStore::new(&h.store_path).get(&movie_a().key).unwrap(), None);
    }

    #[test]
    fn test_stop_goes_idle_and_sends_nothing() {
        let mut h = harness();
        h.engine.on_started(movie_a(), Some(AspectRatio::Scope));
        assert!(h.engine.on_stopped().is_empty());
        assert_eq!(h.engine.state(), EngineState::Idle);
        assert_eq!(h.engine.active_title(), None);

        assert!(h.engine.on_paused().is_empty());
        assert!(h.engine.on_resumed().is_empty());
        assert!(h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Flat))
            .is_empty());
    }

    #[test]
    fn test_restore_on_stop() {
        let config = ProjectorConfig {
            restore_on_stop: true,
            ..ProjectorConfig::default()
        };
        let mut h = harness_with(config, ScriptedSource::new(Duration::ZERO));
        assert!(h.engine.on_stopped().is_empty());

        h.engine.on_started(movie_a(), Some(AspectRatio::Scope));
        assert_eq!(h.engine.on_stopped(), vec![lens(AspectRatio::Flat)]);
    }

    #[test]
    fn test_restore_on_pause() {
        let config = ProjectorConfig {
            restore_on_pause: true,
            ..ProjectorConfig::default()
        };
        let mut h = harness_with(config, ScriptedSource::new(Duration::ZERO));
        h.engine.on_started(movie_a(), Some(AspectRatio::Scope));

        assert_eq!(h.engine.on_paused(), vec![lens(AspectRatio::Flat)]);
        assert!(h.engine.on_paused().is_empty());

        // A lookup during the pause waits for resume
        assert!(h
            .engine
            .on_resolved(&movie_a().key, Lookup::Found(AspectRatio::Other(240)))
            .is_empty());
        assert_eq!(h.engine.on_resumed(), vec![lens(AspectRatio::Other(240))]);
    }

    #[test]
    fn test_pause_without_restore_keeps_lens() {
        let mut h = harness();
        h.engine.on_started(movie_a(), Some(AspectRatio::Scope));
        assert!(h.engine.on_paused().is_empty());
        assert!(h.engine.on_resumed().is_empty());
    }
}
