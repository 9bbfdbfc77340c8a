// Background player engine. Runs in its own thread, communicates with
// the host via crossbeam channels, and paces playback frames to the
// header's play speed.

pub mod engine;
pub mod memory;
pub mod nsf_file;

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};

use crate::apu_device::ApuSink;
use crate::NsfError;
use engine::Engine;

// ─────────────────────────────────────────────────────────────────────────────
//  Public message types
// ─────────────────────────────────────────────────────────────────────────────

/// Commands sent from the host to the player thread.
#[derive(Debug, Clone)]
pub enum PlayerCmd {
    Play {
        path: PathBuf,
        /// 1-based song selection; the header's starting-song offset is
        /// applied before it reaches the tune.
        song: u8,
    },
    Stop,
    TogglePause,
    SetSubtune(u8),
    Quit,
}

/// Status updates sent from the player thread to the host.
#[derive(Debug, Clone)]
pub struct PlayerStatus {
    pub state: PlayState,
    pub track_info: Option<TrackInfo>,
    pub elapsed: Duration,
    pub writes_per_frame: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlayState {
    Stopped,
    Playing,
    Paused,
}

#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub path: PathBuf,
    pub name: String,
    pub artist: String,
    pub copyright: String,
    pub songs: u8,
    pub current_song: u8,
    pub is_pal: bool,
    pub chips: Vec<&'static str>,
}

/// Builds a fresh APU sink for each playback start.
pub type SinkFactory = Box<dyn FnMut() -> Box<dyn ApuSink> + Send>;

// ─────────────────────────────────────────────────────────────────────────────
//  Player thread
// ─────────────────────────────────────────────────────────────────────────────

pub fn spawn_player(make_sink: SinkFactory) -> (Sender<PlayerCmd>, Receiver<PlayerStatus>) {
    let (cmd_tx, cmd_rx) = bounded::<PlayerCmd>(64);
    let (status_tx, status_rx) = bounded::<PlayerStatus>(16);

    thread::Builder::new()
        .name("nsf-player".into())
        .spawn(move || {
            player_loop(cmd_rx, status_tx, make_sink);
        })
        .expect("Failed to spawn player thread");

    (cmd_tx, status_rx)
}

fn player_loop(
    cmd_rx: Receiver<PlayerCmd>,
    status_tx: Sender<PlayerStatus>,
    mut make_sink: SinkFactory,
) {
    let mut state = PlayState::Stopped;
    let mut play_ctx: Option<PlayContext> = None;
    let mut last_error: Option<String> = None;

    let idle_tick = tick(Duration::from_millis(100));

    loop {
        match state {
            PlayState::Stopped | PlayState::Paused => {
                select! {
                    recv(cmd_rx) -> msg => {
                        match msg {
                            Ok(PlayerCmd::Quit) => break,
                            Ok(cmd) => handle_cmd(
                                cmd, &mut state, &mut play_ctx,
                                &mut last_error, &mut make_sink, &status_tx,
                            ),
                            Err(_) => break,
                        }
                    }
                    recv(idle_tick) -> _ => {
                        send_status(&state, &play_ctx, &last_error, &status_tx);
                    }
                }
            }
            PlayState::Playing => {
                // Drain commands (also detect host shutdown).
                loop {
                    match cmd_rx.try_recv() {
                        Ok(PlayerCmd::Quit) => {
                            cleanup(&mut play_ctx);
                            return;
                        }
                        Ok(other) => handle_cmd(
                            other,
                            &mut state,
                            &mut play_ctx,
                            &mut last_error,
                            &mut make_sink,
                            &status_tx,
                        ),
                        Err(crossbeam_channel::TryRecvError::Empty) => break,
                        Err(crossbeam_channel::TryRecvError::Disconnected) => {
                            cleanup(&mut play_ctx);
                            return;
                        }
                    }
                }

                if state != PlayState::Playing {
                    continue;
                }

                let mut frame_error: Option<NsfError> = None;
                if let Some(ctx) = play_ctx.as_mut() {
                    match ctx.engine.playback_frame() {
                        Ok(()) => {
                            // Absolute-timeline pacing: advance the deadline
                            // by one frame period so per-frame overhead does
                            // not accumulate as drift.
                            ctx.next_frame += ctx.frame_dur;
                            let now = Instant::now();
                            if ctx.next_frame < now {
                                // Fell behind (pause, bank churn): snap to
                                // now rather than fast-forwarding.
                                ctx.next_frame = now;
                            }
                            wait_until(ctx.next_frame);

                            ctx.frame_count += 1;
                            ctx.elapsed += ctx.frame_dur;
                        }
                        Err(e) => frame_error = Some(e),
                    }
                } else {
                    state = PlayState::Stopped;
                    continue;
                }

                if let Some(e) = frame_error {
                    eprintln!("[pulsewave] Frame playback failed: {e}");
                    last_error = Some(e.to_string());
                    stop_playback(&mut play_ctx);
                    state = PlayState::Stopped;
                }

                send_status(&state, &play_ctx, &last_error, &status_tx);
            }
        }
    }

    cleanup(&mut play_ctx);
}

/// Silence the sink and drop the engine, releasing the exclusive slot.
fn stop_playback(play_ctx: &mut Option<PlayContext>) {
    if let Some(mut ctx) = play_ctx.take() {
        ctx.engine.reset_sink();
    }
}

fn cleanup(play_ctx: &mut Option<PlayContext>) {
    stop_playback(play_ctx);
    eprintln!("[pulsewave] Player thread exiting");
}

fn send_status(
    state: &PlayState,
    ctx: &Option<PlayContext>,
    error: &Option<String>,
    tx: &Sender<PlayerStatus>,
) {
    let (info, elapsed, writes) = match ctx {
        Some(c) => (
            Some(c.track_info.clone()),
            c.elapsed,
            c.engine.frame_apu_writes(),
        ),
        None => (None, Duration::ZERO, 0),
    };

    let _ = tx.try_send(PlayerStatus {
        state: state.clone(),
        track_info: info,
        elapsed,
        writes_per_frame: writes,
        error: error.clone(),
    });
}

fn handle_cmd(
    cmd: PlayerCmd,
    state: &mut PlayState,
    play_ctx: &mut Option<PlayContext>,
    last_error: &mut Option<String>,
    make_sink: &mut SinkFactory,
    status_tx: &Sender<PlayerStatus>,
) {
    match cmd {
        PlayerCmd::Play { path, song } => {
            *last_error = None;
            stop_playback(play_ctx);

            match start_playback(path, song, make_sink()) {
                Ok(ctx) => {
                    *play_ctx = Some(ctx);
                    *state = PlayState::Playing;
                }
                Err(e) => {
                    eprintln!("[pulsewave] Cannot start playback: {e}");
                    *last_error = Some(e.to_string());
                    *state = PlayState::Stopped;
                }
            }
            send_status(state, play_ctx, last_error, status_tx);
        }

        PlayerCmd::Stop => {
            stop_playback(play_ctx);
            *state = PlayState::Stopped;
            send_status(state, play_ctx, last_error, status_tx);
        }

        PlayerCmd::TogglePause => {
            match state {
                PlayState::Playing => *state = PlayState::Paused,
                PlayState::Paused => {
                    if let Some(ctx) = play_ctx.as_mut() {
                        ctx.next_frame = Instant::now();
                    }
                    *state = PlayState::Playing;
                }
                PlayState::Stopped => {}
            }
            send_status(state, play_ctx, last_error, status_tx);
        }

        PlayerCmd::SetSubtune(song) => {
            *last_error = None;
            if let Some(path) = play_ctx.as_ref().map(|c| c.track_info.path.clone()) {
                stop_playback(play_ctx);
                match start_playback(path, song, make_sink()) {
                    Ok(ctx) => {
                        *play_ctx = Some(ctx);
                        *state = PlayState::Playing;
                    }
                    Err(e) => {
                        eprintln!("[pulsewave] Cannot switch subtune: {e}");
                        *last_error = Some(e.to_string());
                        *state = PlayState::Stopped;
                    }
                }
            }
            send_status(state, play_ctx, last_error, status_tx);
        }

        PlayerCmd::Quit => {}
    }
}

/// Wait until `deadline` using sleep for bulk + spin for precision.
/// Sleeps most of the duration, then spin-waits the last ~1ms for
/// sub-millisecond accuracy without burning 100% CPU.
fn wait_until(deadline: Instant) {
    let now = Instant::now();
    if now >= deadline {
        return;
    }
    let remaining = deadline - now;
    // Sleep granularity is ~1ms on most OSes.
    if remaining > Duration::from_micros(1500) {
        thread::sleep(remaining - Duration::from_micros(1000));
    }
    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
//  Playback setup
// ─────────────────────────────────────────────────────────────────────────────

struct PlayContext {
    engine: Engine,
    frame_dur: Duration,
    elapsed: Duration,
    track_info: TrackInfo,
    frame_count: u64,
    next_frame: Instant,
}

fn start_playback(
    path: PathBuf,
    song: u8,
    sink: Box<dyn ApuSink>,
) -> Result<PlayContext, NsfError> {
    let mut engine = Engine::open(&path)?;
    engine.log_header();

    let header = engine.header().clone();
    if song < 1 || song > header.total_songs {
        eprintln!("[pulsewave] Invalid song index: {song}");
        return Err(NsfError::InvalidArg("song index out of range"));
    }

    // 1-based selection relative to the header's starting song.
    let absolute = header.starting_song as u16 + (song as u16 - 1);
    engine.playback_init(absolute as u8, sink)?;

    eprintln!(
        "[pulsewave] Playing \"{}\" by {} (song {}/{})",
        header.name, header.artist, song, header.total_songs,
    );

    let track_info = TrackInfo {
        path,
        name: header.name.clone(),
        artist: header.artist.clone(),
        copyright: header.copyright.clone(),
        songs: header.total_songs,
        current_song: song,
        is_pal: header.effective_pal(),
        chips: header.chip_names(),
    };

    Ok(PlayContext {
        engine,
        frame_dur: Duration::from_micros(header.frame_us()),
        elapsed: Duration::ZERO,
        track_info,
        frame_count: 0,
        next_frame: Instant::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apu_device::NullSink;
    use crate::player::nsf_file::NsfHeader;
    use crate::test_support::engine_lock;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// One-song NSF whose INIT and PLAY are plain RTS routines.
    fn fixture() -> NamedTempFile {
        let header = NsfHeader {
            version: 1,
            total_songs: 1,
            starting_song: 0,
            load_address: 0x8000,
            init_address: 0x8000,
            play_address: 0x8001,
            name: "fixture".into(),
            artist: String::new(),
            copyright: String::new(),
            play_speed_ntsc: 16666,
            bankswitch_init: [0; 8],
            play_speed_pal: 20000,
            pal_ntsc_bits: 0,
            extra_sound_chips: 0,
            extra: [0; 4],
        };
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&header.to_bytes()).unwrap();
        tmp.write_all(&[0x60, 0x60]).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    /// Drain until the thread closes the status channel, proving the
    /// engine was dropped.
    fn drain_until_exit(status_rx: &Receiver<PlayerStatus>) {
        while status_rx.recv().is_ok() {}
    }

    #[test]
    fn test_player_thread_plays_and_quits() {
        let _guard = engine_lock();
        let tmp = fixture();

        let (cmd_tx, status_rx) = spawn_player(Box::new(|| Box::new(NullSink)));
        cmd_tx
            .send(PlayerCmd::Play {
                path: tmp.path().to_path_buf(),
                song: 1,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut playing = false;
        while Instant::now() < deadline {
            match status_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(s) if s.state == PlayState::Playing => {
                    assert!(s.track_info.is_some());
                    assert!(s.error.is_none());
                    playing = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(playing);

        cmd_tx.send(PlayerCmd::Quit).unwrap();
        drain_until_exit(&status_rx);
    }

    #[test]
    fn test_invalid_song_reports_error() {
        let _guard = engine_lock();
        let tmp = fixture();

        let (cmd_tx, status_rx) = spawn_player(Box::new(|| Box::new(NullSink)));
        cmd_tx
            .send(PlayerCmd::Play {
                path: tmp.path().to_path_buf(),
                song: 99,
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut reported = false;
        while Instant::now() < deadline {
            match status_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(s) if s.error.is_some() => {
                    assert_eq!(s.state, PlayState::Stopped);
                    reported = true;
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
        assert!(reported);

        cmd_tx.send(PlayerCmd::Quit).unwrap();
        drain_until_exit(&status_rx);
    }
}
