// NSF playback controller: owns the 6502 and the NES memory it runs
// against, and advances the driver stub one PLAY call at a time.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use mos6502::cpu::CPU;
use mos6502::instruction::Nmos6502;
use mos6502::memory::Bus;
use mos6502::registers::{StackPointer, Status};

use crate::apu_device::ApuSink;
use crate::NsfError;

use super::memory::NesMemory;
use super::nsf_file::{self, NsfHeader};

/// PC of the stub's JSR PLAY instruction; the stub's closing JMP lands
/// back here, so reaching it marks a frame boundary.
const IDLE_PC: u16 = 0x1007;

/// Step budget for INIT (tunes may decompress or build tables).
const INIT_MAX_STEPS: u32 = 2_000_000;

/// Step budget for one PLAY call.
const FRAME_MAX_STEPS: u32 = 200_000;

/// Whether an engine instance is live. The 6502 binding is exclusive:
/// a second open fails instead of silently sharing the bus.
static ENGINE_ACTIVE: AtomicBool = AtomicBool::new(false);

// ─────────────────────────────────────────────────────────────────────────────
//  Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct Engine {
    cpu: CPU<NesMemory, Nmos6502>,
    header: NsfHeader,
    path: PathBuf,
    /// Set by a successful playback_init, cleared by any failure.
    ready: bool,
}

impl Engine {
    /// Open an NSF file for playback. At most one engine may be live in
    /// the process at a time.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NsfError> {
        if ENGINE_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            eprintln!("[pulsewave] Cannot have multiple NSF files open");
            return Err(NsfError::AlreadyOpen);
        }

        match Self::open_exclusive(path.as_ref()) {
            Ok(engine) => Ok(engine),
            Err(e) => {
                ENGINE_ACTIVE.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn open_exclusive(path: &Path) -> Result<Self, NsfError> {
        let mut file = File::open(path)?;
        let header = nsf_file::read_header_from(&mut file)?;
        let memory = NesMemory::new(file, header.load_address);
        Ok(Self {
            cpu: CPU::new(memory, Nmos6502),
            header,
            path: path.to_path_buf(),
            ready: false,
        })
    }

    pub fn header(&self) -> &NsfHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dump the header fields to the log.
    pub fn log_header(&self) {
        self.header.log();
    }

    /// APU writes forwarded to the sink during the last frame.
    pub fn frame_apu_writes(&self) -> usize {
        self.cpu.memory.frame_apu_writes
    }

    /// Ask the sink to silence its backend.
    pub fn reset_sink(&mut self) {
        if let Some(sink) = self.cpu.memory.sink_mut() {
            sink.reset();
        }
    }

    /// Prepare playback of `song` (0-based, as handed to the tune's INIT
    /// in the accumulator): reset memory, build the driver stub, load ROM
    /// banked or contiguous, then run the CPU through INIT until it parks
    /// at the frame boundary.
    pub fn playback_init(&mut self, song: u8, sink: Box<dyn ApuSink>) -> Result<(), NsfError> {
        self.ready = false;

        if self.header.load_address < 0x8000 {
            eprintln!(
                "[pulsewave] Bad load address: ${:04X}",
                self.header.load_address
            );
            return Err(NsfError::BadLoadAddress);
        }

        let region = self.header.effective_pal() as u8;
        let mem = &mut self.cpu.memory;
        mem.reset_playback();
        mem.set_sink(sink);
        mem.install_driver_stub(
            song,
            region,
            self.header.init_address,
            self.header.play_address,
        );

        if self.header.has_bank_switching() {
            eprintln!("[pulsewave] Playback init loading bankswitched ROM");
            mem.init_rom_banks(&self.header.bankswitch_init)?;
        } else {
            eprintln!("[pulsewave] Playback init loading contiguous ROM");
            mem.load_contiguous_rom()?;
        }

        self.reset_cpu();
        run_to_idle(&mut self.cpu, INIT_MAX_STEPS)?;
        self.ready = true;
        Ok(())
    }

    /// Advance playback by one frame: exactly one pass of the stub's
    /// JSR PLAY / JMP loop. APU writes reach the sink synchronously, in
    /// program order, and bank switches take effect before any later
    /// fetch from the affected slot.
    pub fn playback_frame(&mut self) -> Result<(), NsfError> {
        if !self.ready {
            return Err(NsfError::InvalidState("playback not initialized"));
        }
        if self.cpu.registers.program_counter != IDLE_PC {
            return Err(NsfError::InvalidState("PC is not at the frame boundary"));
        }

        self.cpu.memory.begin_frame();
        match run_to_idle(&mut self.cpu, FRAME_MAX_STEPS) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.ready = false;
                Err(e)
            }
        }
    }

    /// Release the engine: the file and ROM buffers close on drop, and
    /// the process-wide slot frees for the next open.
    pub fn close(self) {}

    /// Hardware reset: PC from the $FFFC/$FFFD vector, stack at $FD,
    /// interrupts masked.
    fn reset_cpu(&mut self) {
        let lo = self.cpu.memory.get_byte(0xFFFC) as u16;
        let hi = self.cpu.memory.get_byte(0xFFFD) as u16;
        self.cpu.registers.program_counter = (hi << 8) | lo;
        self.cpu.registers.stack_pointer = StackPointer(0xFD);
        self.cpu.registers.accumulator = 0;
        self.cpu.registers.status.insert(Status::PS_DISABLE_INTERRUPTS);
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        ENGINE_ACTIVE.store(false, Ordering::SeqCst);
    }
}

/// Step the CPU until it reaches the frame boundary. The budget turns a
/// runaway INIT/PLAY routine into an error instead of a hang; a bank
/// load that failed inside a bus write surfaces here.
fn run_to_idle(cpu: &mut CPU<NesMemory, Nmos6502>, max_steps: u32) -> Result<(), NsfError> {
    for _ in 0..max_steps {
        cpu.single_step();
        if let Some(e) = cpu.memory.take_pending_error() {
            return Err(e);
        }
        if cpu.registers.program_counter == IDLE_PC {
            return Ok(());
        }
    }
    eprintln!("[pulsewave] CPU did not return to the frame boundary");
    Err(NsfError::InvalidState("step budget exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::engine_lock;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tempfile::NamedTempFile;

    struct Capture(Arc<Mutex<Vec<(u16, u8)>>>);

    impl ApuSink for Capture {
        fn write(&mut self, addr: u16, value: u8) {
            self.0.lock().unwrap().push((addr, value));
        }
    }

    fn test_header(load: u16, init: u16, play: u16, bankswitch: [u8; 8]) -> NsfHeader {
        NsfHeader {
            version: 1,
            total_songs: 1,
            starting_song: 0,
            load_address: load,
            init_address: init,
            play_address: play,
            name: "test".into(),
            artist: String::new(),
            copyright: String::new(),
            play_speed_ntsc: 16666,
            bankswitch_init: bankswitch,
            play_speed_pal: 20000,
            pal_ntsc_bits: 0,
            extra_sound_chips: 0,
            extra: [0; 4],
        }
    }

    fn write_nsf(header: &NsfHeader, body: &[u8]) -> NamedTempFile {
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&header.to_bytes()).unwrap();
        tmp.write_all(body).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    // INIT at $8000: LDA #$0F; STA $4015; RTS
    // PLAY at $8006: LDA #$01; STA $4000; RTS
    const TEST_PROGRAM: [u8; 12] = [
        0xA9, 0x0F, 0x8D, 0x15, 0x40, 0x60, //
        0xA9, 0x01, 0x8D, 0x00, 0x40, 0x60,
    ];

    #[test]
    fn test_playback_init_and_frames() {
        let _guard = engine_lock();
        let header = test_header(0x8000, 0x8000, 0x8006, [0; 8]);
        let tmp = write_nsf(&header, &TEST_PROGRAM);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::open(tmp.path()).unwrap();
        engine
            .playback_init(0, Box::new(Capture(log.clone())))
            .unwrap();

        // INIT ran once and hit the APU status register.
        assert_eq!(*log.lock().unwrap(), vec![(0x4015, 0x0F)]);
        assert_eq!(engine.cpu.registers.program_counter, IDLE_PC);

        // Each frame is one PLAY call.
        engine.playback_frame().unwrap();
        assert_eq!(engine.frame_apu_writes(), 1);
        engine.playback_frame().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0x4015, 0x0F), (0x4000, 0x01), (0x4000, 0x01)]
        );
    }

    #[test]
    fn test_playback_init_banked() {
        let _guard = engine_lock();
        // Bank 1 mapped at every slot; the program sits at the start of
        // bank 1, which follows the 4 KiB bank 0 in the file.
        let header = test_header(0x8000, 0x8000, 0x8006, [1; 8]);
        let mut body = vec![0u8; 4096];
        body.extend_from_slice(&TEST_PROGRAM);
        let tmp = write_nsf(&header, &body);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::open(tmp.path()).unwrap();
        engine
            .playback_init(0, Box::new(Capture(log.clone())))
            .unwrap();

        assert_eq!(engine.cpu.memory.get_byte(0x8000), 0xA9);
        engine.playback_frame().unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![(0x4015, 0x0F), (0x4000, 0x01)]
        );
    }

    #[test]
    fn test_only_one_engine_at_a_time() {
        let _guard = engine_lock();
        let header = test_header(0x8000, 0x8000, 0x8006, [0; 8]);
        let a = write_nsf(&header, &TEST_PROGRAM);
        let b = write_nsf(&header, &TEST_PROGRAM);

        let first = Engine::open(a.path()).unwrap();
        assert!(matches!(
            Engine::open(b.path()),
            Err(NsfError::AlreadyOpen)
        ));

        first.close();
        let second = Engine::open(b.path()).unwrap();
        drop(second);
    }

    #[test]
    fn test_bad_load_address() {
        let _guard = engine_lock();
        let header = test_header(0x4000, 0x4000, 0x4003, [0; 8]);
        let tmp = write_nsf(&header, &TEST_PROGRAM);

        let mut engine = Engine::open(tmp.path()).unwrap();
        assert!(matches!(
            engine.playback_init(0, Box::new(crate::apu_device::NullSink)),
            Err(NsfError::BadLoadAddress)
        ));
        // A failed init leaves the engine unplayable.
        assert!(matches!(
            engine.playback_frame(),
            Err(NsfError::InvalidState(_))
        ));
    }

    #[test]
    fn test_frame_requires_init() {
        let _guard = engine_lock();
        let header = test_header(0x8000, 0x8000, 0x8006, [0; 8]);
        let tmp = write_nsf(&header, &TEST_PROGRAM);

        let mut engine = Engine::open(tmp.path()).unwrap();
        assert!(matches!(
            engine.playback_frame(),
            Err(NsfError::InvalidState(_))
        ));
    }

    #[test]
    fn test_reinit_switches_song() {
        let _guard = engine_lock();
        // INIT stores the song number (in A) to $4003: the captured value
        // tracks which song was selected.
        // $8000: STA $4003; RTS   $8004: RTS (play)
        let body = [0x8D, 0x03, 0x40, 0x60, 0x60];
        let header = test_header(0x8000, 0x8000, 0x8004, [0; 8]);
        let tmp = write_nsf(&header, &body);

        let log = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::open(tmp.path()).unwrap();

        engine
            .playback_init(2, Box::new(Capture(log.clone())))
            .unwrap();
        engine
            .playback_init(5, Box::new(Capture(log.clone())))
            .unwrap();
        assert_eq!(*log.lock().unwrap(), vec![(0x4003, 2), (0x4003, 5)]);
    }

    #[test]
    fn test_short_file_fails_open() {
        let _guard = engine_lock();
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(&[0x4E, 0x45, 0x53, 0x4D, 0x1A, 1]).unwrap();
        tmp.flush().unwrap();
        assert!(matches!(
            Engine::open(tmp.path()),
            Err(NsfError::ShortHeader)
        ));
    }
}
