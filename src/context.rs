//! Daemon context and event loop
//!
//! `AppContext` owns everything the daemon keeps for its lifetime: both
//! transports and their writers, the engine, the lighting controller, the
//! resolver and the trigger inbox. It is built once at startup and consumed
//! by `run`, which tears it down on the way out.

use crate::aspect::{AspectRatio, LensCommand};
use crate::config::Config;
use crate::dispatch::{TriggerAction, TriggerInbox};
use crate::engine::{Command, Engine};
use crate::events::{self, Event};
use crate::lighting::{DimmerJob, LightingController, PlaybackChange};
use crate::metadata::{ImdbSource, MetadataResolver, MetadataSource};
use crate::overrides::OverrideStore;
use crate::serial::{LatestWriter, SerialTransport, WriterOptions};
use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Capacity of the loop channel
const EVENT_QUEUE: usize = 64;
/// How long shutdown waits for a write in progress
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

struct Lighting {
    controller: LightingController,
    writer: LatestWriter<DimmerJob>,
    transport: Arc<SerialTransport>,
}

pub struct AppContext {
    config: Config,
    engine: Engine,
    resolver: Arc<MetadataResolver>,
    projector: Arc<SerialTransport>,
    lens_writer: LatestWriter<LensCommand>,
    lighting: Option<Lighting>,
    inbox: TriggerInbox,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
    open_inputs: usize,
}

/// Open a transport at startup. Only a bad port setting is fatal; a device
/// that is merely off gets another chance on the first command.
fn open_eagerly(transport: &SerialTransport) -> Result<()> {
    match transport.open() {
        Ok(()) => {
            debug!("{} ready on {}", transport.name(), transport.port());
            Ok(())
        }
        Err(e) if e.is_config_error() => {
            Err(e).with_context(|| format!("cannot use {} port", transport.name()))
        }
        Err(e) => {
            warn!("{}; will retry on first command", e);
            Ok(())
        }
    }
}

impl AppContext {
    /// Build the context from configuration, opening real devices
    pub fn start(config: Config) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let line = config.projector.line();
        let projector = SerialTransport::serial("projector", line.port_config())
            .with_retries(line.retries);
        open_eagerly(&projector)?;

        let lighting = if config.lighting.enabled {
            let line = config.lighting.line();
            let transport =
                SerialTransport::serial("plm", line.port_config()).with_retries(line.retries);
            open_eagerly(&transport)?;
            Some(Arc::new(transport))
        } else {
            info!("Lighting disabled");
            None
        };

        let source =
            ImdbSource::new(&config.metadata).context("failed to build metadata client")?;

        Ok(Self::with_parts(
            config,
            Arc::new(projector),
            lighting,
            Arc::new(source),
        ))
    }

    /// Build the context around already constructed collaborators
    pub fn with_parts(
        config: Config,
        projector: Arc<SerialTransport>,
        lighting_transport: Option<Arc<SerialTransport>>,
        source: Arc<dyn MetadataSource>,
    ) -> Self {
        let resolver = Arc::new(MetadataResolver::new(source, &config.metadata));
        let overrides = OverrideStore::new(&config.overrides.path);
        let engine = Engine::new(&config.projector, overrides, Arc::clone(&resolver));

        let lens_writer = LatestWriter::spawn(
            Arc::clone(&projector),
            WriterOptions {
                settle: Duration::from_millis(config.projector.settle_ms),
                frame_gap: Duration::ZERO,
                skip_repeats: true,
            },
        );

        let lighting = lighting_transport.map(|transport| Lighting {
            controller: LightingController::new(&config.lighting),
            writer: LatestWriter::spawn(
                Arc::clone(&transport),
                WriterOptions {
                    settle: Duration::ZERO,
                    frame_gap: Duration::from_millis(config.lighting.command_gap_ms),
                    skip_repeats: false,
                },
            ),
            transport,
        });

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);

        Self {
            config,
            engine,
            resolver,
            projector,
            lens_writer,
            lighting,
            inbox: TriggerInbox::new(),
            tx,
            rx,
            open_inputs: 0,
        }
    }

    /// Sender for injecting events into the loop
    pub fn sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    /// Start the configured listeners and run until input ends or Ctrl-C
    pub async fn run(mut self) -> Result<()> {
        if self.config.events.stdin {
            tokio::spawn(events::listen_stdin(self.tx.clone()));
            self.open_inputs += 1;
        }
        if let Some(addr) = self.config.events.udp_listen.clone() {
            let socket = events::bind_udp(&addr)
                .await
                .with_context(|| format!("failed to listen on udp://{}", addr))?;
            tokio::spawn(events::listen_udp(socket, self.tx.clone()));
            self.open_inputs += 1;
        }
        if self.open_inputs == 0 {
            bail!("no event input enabled; set events.stdin or events.udp_listen");
        }

        self.run_loop().await;
        Ok(())
    }

    /// The event loop proper. Drains whatever is queued, then the trigger
    /// inbox, so repeated triggers in one burst collapse.
    pub async fn run_loop(mut self) {
        info!("lensmem running (engine {})", self.engine.state());
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut batch = Vec::new();

        'events: loop {
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => batch.push(event),
                    None => break,
                },
                _ = &mut ctrl_c => {
                    info!("Interrupted");
                    break;
                }
            }
            while let Ok(event) = self.rx.try_recv() {
                batch.push(event);
            }

            for event in batch.drain(..) {
                if !self.handle(event) {
                    break 'events;
                }
            }
            if !self.inbox.is_empty() {
                for action in self.inbox.drain(Instant::now()) {
                    self.dispatch(action);
                }
            }
        }

        self.shutdown().await;
    }

    /// Process one event; false once the loop should stop
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Started {
                title,
                player_ratio,
            } => {
                self.lighting_playback(PlaybackChange::Started);
                let commands = self.engine.on_started(title, player_ratio);
                self.execute(commands);
            }
            Event::Stopped => {
                let commands = self.engine.on_stopped();
                self.execute(commands);
                self.lighting_playback(PlaybackChange::Stopped);
            }
            Event::Paused => {
                let commands = self.engine.on_paused();
                self.execute(commands);
                self.lighting_playback(PlaybackChange::Paused);
            }
            Event::Resumed => {
                let commands = self.engine.on_resumed();
                self.execute(commands);
                self.lighting_playback(PlaybackChange::Resumed);
            }
            Event::Trigger {
                action,
                expiry,
                received,
            } => {
                let expiry = expiry.unwrap_or_else(|| self.config.triggers.default_expiry());
                self.inbox.post(action, expiry, received);
            }
            Event::MenuSelected(ratio) => {
                let commands = self.engine.on_menu_selected(ratio);
                self.execute(commands);
            }
            Event::MenuCancelled => {
                let commands = self.engine.on_menu_cancelled();
                self.execute(commands);
            }
            Event::Resolved { key, lookup } => {
                let commands = self.engine.on_resolved(&key, lookup);
                self.execute(commands);
            }
            Event::InputClosed => {
                self.open_inputs = self.open_inputs.saturating_sub(1);
                if self.open_inputs == 0 {
                    info!("All event inputs closed");
                    return false;
                }
            }
        }
        true
    }

    fn dispatch(&mut self, action: TriggerAction) {
        info!("Trigger {}", action);
        match action {
            TriggerAction::Lighting(request) => match self.lighting.as_mut() {
                Some(lighting) => {
                    if let Some(job) = lighting.controller.on_action(request) {
                        lighting.writer.publish(job);
                    }
                }
                None => debug!("Lighting disabled; ignoring {}", action),
            },
            _ => {
                let commands = self.engine.on_trigger(action);
                self.execute(commands);
            }
        }
    }

    fn lighting_playback(&mut self, change: PlaybackChange) {
        if let Some(lighting) = self.lighting.as_mut() {
            if let Some(job) = lighting.controller.on_playback(change) {
                lighting.writer.publish(job);
            }
        }
    }

    fn execute(&mut self, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Lens { command, .. } => self.lens_writer.publish(command),
                Command::Lookup(title) => {
                    let resolver = Arc::clone(&self.resolver);
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let lookup = resolver.resolve(&title).await;
                        let event = Event::Resolved {
                            key: title.key,
                            lookup,
                        };
                        if tx.send(event).await.is_err() {
                            debug!("Lookup finished after shutdown");
                        }
                    });
                }
                Command::ShowMenu(request) => match serde_json::to_string(&request) {
                    Ok(line) => println!("{}", line),
                    Err(e) => error!("Menu request not encoded: {}", e),
                },
            }
        }
    }

    async fn shutdown(self) {
        match self.engine.active_title() {
            Some(key) => info!(
                "Shutting down while {} plays at {}",
                key,
                self.engine.current_ratio().unwrap_or(AspectRatio::Unknown)
            ),
            None => info!("Shutting down"),
        }
        self.lens_writer.shutdown(SHUTDOWN_GRACE).await;
        self.projector.close();
        if let Some(lighting) = self.lighting {
            lighting.writer.shutdown(SHUTDOWN_GRACE).await;
            lighting.transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lighting::insteon::set_level_frame;
    use crate::lighting::insteon::InsteonAddress;
    use crate::metadata::testing::ScriptedSource;
    use crate::serial::transport::testing::Recorder;
    use crate::title::Title;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        ctx: AppContext,
        projector: Recorder,
        plm: Recorder,
        _dir: TempDir,
    }

    fn rig(source: ScriptedSource) -> Rig {
        let dir = tempdir().unwrap();
        let mut config = Config::default();
        config.projector.settle_ms = 0;
        config.lighting.command_gap_ms = 0;
        config.overrides.path = dir.path().join("overrides.toml");

        let projector = Recorder::default();
        let plm = Recorder::default();
        let ctx = AppContext::with_parts(
            config,
            Arc::new(projector.transport("projector")),
            Some(Arc::new(plm.transport("plm"))),
            Arc::new(source),
        );
        Rig {
            ctx,
            projector,
            plm,
            _dir: dir,
        }
    }

    fn lens_frame(slot: u8) -> Vec<u8> {
        LensCommand::new(slot).to_bytes()
    }

    fn trigger(name: &str, expiry_ms: u64, received: Instant) -> Event {
        Event::Trigger {
            action: name.parse().unwrap(),
            expiry: Some(Duration::from_millis(expiry_ms)),
            received,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    #[tokio::test]
    async fn test_player_ratio_then_lookup_end_to_end() {
        let source = ScriptedSource::new(Duration::from_millis(50))
            .answer("Movie A", Ok(Some(AspectRatio::Scope)));
        let rig = rig(source);
        let tx = rig.ctx.sender();
        let task = tokio::spawn(rig.ctx.run_loop());

        tx.send(Event::Started {
            title: Title::named("Movie A"),
            player_ratio: Some(AspectRatio::Flat),
        })
        .await
        .unwrap();
        settle().await;
        tx.send(Event::InputClosed).await.unwrap();
        task.await.unwrap();

        assert_eq!(rig.projector.frames(), vec![lens_frame(2), lens_frame(3)]);
        let pots = InsteonAddress([0x42, 0x22, 0xB8]);
        let tray = InsteonAddress([0x42, 0x20, 0xF8]);
        assert_eq!(
            rig.plm.frames(),
            vec![set_level_frame(pots, 0), set_level_frame(tray, 30)]
        );
    }

    #[tokio::test]
    async fn test_idle_trigger_sends_lens() {
        let rig = rig(ScriptedSource::new(Duration::ZERO));
        let tx = rig.ctx.sender();
        let task = tokio::spawn(rig.ctx.run_loop());

        tx.send(trigger("aspectratiochanger-set235", 10_000, Instant::now()))
            .await
            .unwrap();
        settle().await;
        tx.send(Event::InputClosed).await.unwrap();
        task.await.unwrap();

        assert_eq!(rig.projector.frames(), vec![lens_frame(3)]);
        assert!(rig.plm.frames().is_empty());
    }

    #[tokio::test]
    async fn test_stale_trigger_is_dropped() {
        let rig = rig(ScriptedSource::new(Duration::ZERO));
        let tx = rig.ctx.sender();
        let task = tokio::spawn(rig.ctx.run_loop());

        let long_ago = Instant::now() - Duration::from_secs(1);
        tx.send(trigger("aspectratiochanger-set235", 100, long_ago))
            .await
            .unwrap();
        tx.send(trigger("insteon-allon", 100, long_ago)).await.unwrap();
        settle().await;
        tx.send(Event::InputClosed).await.unwrap();
        task.await.unwrap();

        assert!(rig.projector.frames().is_empty());
        assert!(rig.plm.frames().is_empty());
    }

    #[tokio::test]
    async fn test_scene_then_step_in_one_burst_commands_every_dimmer() {
        let rig = rig(ScriptedSource::new(Duration::ZERO));
        let tx = rig.ctx.sender();
        let now = Instant::now();
        tx.send(trigger("insteon-alldim", 10_000, now)).await.unwrap();
        tx.send(trigger("insteon-alldimmer", 10_000, now)).await.unwrap();

        let task = tokio::spawn(rig.ctx.run_loop());
        settle().await;
        tx.send(Event::InputClosed).await.unwrap();
        task.await.unwrap();

        let pots = InsteonAddress([0x42, 0x22, 0xB8]);
        let tray = InsteonAddress([0x42, 0x20, 0xF8]);
        let plm = rig.plm.frames();
        assert!(
            plm.contains(&set_level_frame(pots, 0)),
            "pots never got its scene level: {:?}",
            plm
        );
        assert_eq!(plm.last(), Some(&set_level_frame(tray, 0)));
        assert!(rig.projector.frames().is_empty());
    }

    #[tokio::test]
    async fn test_stop_restores_lights_without_lens() {
        let rig = rig(ScriptedSource::new(Duration::ZERO).answer("Movie A", Ok(None)));
        let tx = rig.ctx.sender();
        let task = tokio::spawn(rig.ctx.run_loop());

        tx.send(Event::Started {
            title: Title::named("Movie A"),
            player_ratio: Some(AspectRatio::Scope),
        })
        .await
        .unwrap();
        settle().await;
        tx.send(Event::Stopped).await.unwrap();
        tx.send(trigger("aspectratiochanger-showmenu", 10_000, Instant::now()))
            .await
            .unwrap();
        settle().await;
        tx.send(Event::InputClosed).await.unwrap();
        task.await.unwrap();

        assert_eq!(rig.projector.frames(), vec![lens_frame(3)]);
        let plm = rig.plm.frames();
        assert_eq!(plm.len(), 4);
        let tray = InsteonAddress([0x42, 0x20, 0xF8]);
        assert_eq!(plm[3], set_level_frame(tray, 100));
    }
}
