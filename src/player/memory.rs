// NES memory bus with APU write interception, NSF mapper registers
// ($5FF8-$5FFF), and a fixed-slot LRU cache of 4 KiB ROM banks resolved
// against the open file.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use mos6502::memory::Bus;

use crate::apu_device::ApuSink;
use crate::NsfError;

/// ROM banks are 4 KiB, matching the eight address-space slots that
/// cover $8000-$FFFF.
pub const BANK_SIZE: usize = 4096;

/// Number of RAM-resident cache slots.
pub const BANK_COUNT: usize = 10;

/// Number of address-space ROM slots ($8000, $9000, .., $F000).
const ROM_SLOTS: usize = 8;

/// NSF body offset in the file, right after the 128-byte header.
const BODY_OFFSET: u64 = 0x80;

/// Tail sentinel in the LRU list: entry holds no bank.
const LRU_EMPTY: i16 = -1;

// ─────────────────────────────────────────────────────────────────────────────
//  NES memory bus
// ─────────────────────────────────────────────────────────────────────────────

pub struct NesMemory {
    /// $0000-$07FF: zero page, stack, work RAM.
    ram: [u8; 0x800],
    /// $1000-$107F: the driver stub that calls INIT/PLAY.
    stub: [u8; 0x80],
    /// $4000-$4017: last-written shadow of the APU registers.
    apu_regs: [u8; 0x18],
    /// $5FF8-$5FFF: mapper registers.
    bank_regs: [u8; ROM_SLOTS],
    /// $FFFA-$FFFF: NMI/Reset/IRQ vectors.
    int_vecs: [u8; 6],

    /// ROM arena: BANK_COUNT cache slots when banking, or a flat 32 KiB
    /// image in contiguous mode.
    rom: Vec<u8>,
    /// Arena byte offset each address-space slot resolves to, if mapped.
    rom_block: [Option<usize>; ROM_SLOTS],
    /// Bank id currently shown by each address-space slot.
    rom_block_bank_id: [u8; ROM_SLOTS],
    /// Whether the mapper is active (reads then maintain the LRU).
    banked: bool,

    slot_bank_id: [u8; BANK_COUNT],
    slot_loaded: [bool; BANK_COUNT],
    /// Resident bank ids, most recently used first; LRU_EMPTY past the end.
    lru: [i16; BANK_COUNT],

    file: File,
    load_address: u16,

    sink: Option<Box<dyn ApuSink>>,
    /// APU writes forwarded to the sink since the last begin_frame().
    pub(crate) frame_apu_writes: usize,
    /// Reads from unmapped ROM slots (non-fatal, returns 0).
    pub(crate) unmapped_reads: u64,
    /// Bank-load failure raised inside a CPU-driven bus write; the Bus
    /// trait has no error channel, so the controller collects it after
    /// stepping.
    pending_error: Option<NsfError>,
}

/// Read until `buf` is full or EOF; returns the byte count. A zero-length
/// read at EOF is not an error, the remaining bytes stay as they were.
fn read_fully(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

impl NesMemory {
    pub fn new(file: File, load_address: u16) -> Self {
        Self {
            ram: [0; 0x800],
            stub: [0; 0x80],
            apu_regs: [0; 0x18],
            bank_regs: [0; ROM_SLOTS],
            int_vecs: [0; 6],
            rom: Vec::new(),
            rom_block: [None; ROM_SLOTS],
            rom_block_bank_id: [0; ROM_SLOTS],
            banked: false,
            slot_bank_id: [0; BANK_COUNT],
            slot_loaded: [false; BANK_COUNT],
            lru: [LRU_EMPTY; BANK_COUNT],
            file,
            load_address,
            sink: None,
            frame_apu_writes: 0,
            unmapped_reads: 0,
            pending_error: None,
        }
    }

    /// Reset everything the 6502 can observe to power-on state. ROM
    /// contents are re-established by the bank or contiguous loaders.
    pub(crate) fn reset_playback(&mut self) {
        self.ram = [0; 0x800];
        self.stub = [0; 0x80];
        self.apu_regs = [0; 0x18];
        self.bank_regs = [0; ROM_SLOTS];
        self.int_vecs = [0; 6];
        self.rom_block = [None; ROM_SLOTS];
        self.rom_block_bank_id = [0; ROM_SLOTS];
        self.banked = false;
        self.slot_bank_id = [0; BANK_COUNT];
        self.slot_loaded = [false; BANK_COUNT];
        self.lru = [LRU_EMPTY; BANK_COUNT];
        self.frame_apu_writes = 0;
        self.unmapped_reads = 0;
        self.pending_error = None;

        // Frame counter initial state.
        self.apu_regs[0x17] = 0x40;
    }

    pub(crate) fn set_sink(&mut self, sink: Box<dyn ApuSink>) {
        self.sink = Some(sink);
    }

    pub(crate) fn sink_mut(&mut self) -> Option<&mut (dyn ApuSink + 'static)> {
        self.sink.as_deref_mut()
    }

    pub(crate) fn begin_frame(&mut self) {
        self.frame_apu_writes = 0;
    }

    pub(crate) fn take_pending_error(&mut self) -> Option<NsfError> {
        self.pending_error.take()
    }

    // ── Driver stub ──────────────────────────────────────────────────────

    /// Assemble the driver stub at $1000 and point the reset vector at it:
    /// load song and region, JSR INIT, then loop JSR PLAY / JMP $1007
    /// forever. The controller treats PC = $1007 as the frame boundary,
    /// one PLAY call per loop pass.
    pub(crate) fn install_driver_stub(
        &mut self,
        song: u8,
        region: u8,
        init_address: u16,
        play_address: u16,
    ) {
        let [init_lo, init_hi] = init_address.to_le_bytes();
        let [play_lo, play_hi] = play_address.to_le_bytes();
        self.stub[0x00..0x11].copy_from_slice(&[
            0xA9, song, // LDA #song
            0xA2, region, // LDX #region (0 = NTSC, 1 = PAL)
            0x20, init_lo, init_hi, // JSR init
            0x20, play_lo, play_hi, // JSR play
            0x4C, 0x07, 0x10, // JMP $1007
            0xEA, 0xEA, 0xEA, 0xEA, // NOP filler
        ]);

        // Reset vector -> $1000.
        self.int_vecs[2] = 0x00;
        self.int_vecs[3] = 0x10;
    }

    // ── Contiguous ROM (no bank switching) ───────────────────────────────

    /// Load the whole NSF body into a flat 32 KiB image at the header's
    /// load address and alias all eight ROM slots onto it. No LRU is
    /// involved in this mode.
    pub(crate) fn load_contiguous_rom(&mut self) -> Result<(), NsfError> {
        if self.load_address < 0x8000 {
            eprintln!("[pulsewave] Bad load address: ${:04X}", self.load_address);
            return Err(NsfError::BadLoadAddress);
        }

        self.banked = false;
        self.rom = vec![0; ROM_SLOTS * BANK_SIZE];
        self.rom_block = [None; ROM_SLOTS];
        self.rom_block_bank_id = [0; ROM_SLOTS];

        self.file.seek(SeekFrom::Start(BODY_OFFSET))?;
        let offset = (self.load_address - 0x8000) as usize;
        let max_len = (0xFFFF - self.load_address) as usize;
        let n = read_fully(&mut self.file, &mut self.rom[offset..offset + max_len])?;

        if n == 0 {
            return Err(NsfError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "empty NSF body",
            )));
        }
        if n != max_len {
            eprintln!("[pulsewave] Short ROM body: {n} < {max_len}");
        }

        for i in 0..ROM_SLOTS {
            self.rom_block[i] = Some(i * BANK_SIZE);
        }
        Ok(())
    }

    // ── Bank-switched ROM ────────────────────────────────────────────────

    /// Reset the cache and map the header's initial bank per register.
    pub(crate) fn init_rom_banks(&mut self, bankswitch_init: &[u8; 8]) -> Result<(), NsfError> {
        self.banked = true;
        self.rom = vec![0; BANK_COUNT * BANK_SIZE];
        self.slot_bank_id = [0; BANK_COUNT];
        self.slot_loaded = [false; BANK_COUNT];
        self.lru = [LRU_EMPTY; BANK_COUNT];
        self.rom_block = [None; ROM_SLOTS];
        self.rom_block_bank_id = [0; ROM_SLOTS];

        for (i, &bank) in bankswitch_init.iter().enumerate() {
            self.load_bank(i, bank)?;
        }
        Ok(())
    }

    /// Make ROM slot `register_index` show `bank_id`, fetching the bank
    /// from the file if it is not already resident.
    pub(crate) fn load_bank(&mut self, register_index: usize, bank_id: u8) -> Result<(), NsfError> {
        if register_index >= ROM_SLOTS {
            return Err(NsfError::InvalidArg("bank register index out of range"));
        }

        // Hit: the bank is already resident in some cache slot.
        if let Some(slot) =
            (0..BANK_COUNT).find(|&i| self.slot_loaded[i] && self.slot_bank_id[i] == bank_id)
        {
            self.rom_block[register_index] = Some(slot * BANK_SIZE);
            self.rom_block_bank_id[register_index] = bank_id;
            return self.lru_touch(bank_id);
        }

        // Miss: pick a victim slot, lowest empty first.
        let slot = match self.slot_loaded.iter().position(|&loaded| !loaded) {
            Some(slot) => slot,
            None => self.evict_lru_tail()?,
        };

        let base = slot * BANK_SIZE;
        self.rom[base..base + BANK_SIZE].fill(0);
        self.slot_loaded[slot] = false;

        // Bank 0 sits right after the header and is short by the load
        // padding, read into the slot at that padding; later banks are
        // full 4 KiB. This preserves the file's in-bank alignment.
        let padding = (self.load_address & 0x0FFF) as usize;
        let (file_offset, slot_offset, len) = if bank_id == 0 {
            (BODY_OFFSET, padding, BANK_SIZE - padding)
        } else {
            (
                BODY_OFFSET
                    + (BANK_SIZE - padding) as u64
                    + BANK_SIZE as u64 * (bank_id as u64 - 1),
                0,
                BANK_SIZE,
            )
        };

        self.file.seek(SeekFrom::Start(file_offset))?;
        let dst = base + slot_offset;
        read_fully(&mut self.file, &mut self.rom[dst..dst + len])?;

        self.slot_loaded[slot] = true;
        self.slot_bank_id[slot] = bank_id;
        self.rom_block[register_index] = Some(base);
        self.rom_block_bank_id[register_index] = bank_id;
        self.lru_touch(bank_id)?;

        eprintln!(
            "[pulsewave] Bank loaded: ${:04X} -> {bank_id} (slot {slot})",
            0x5FF8 + register_index
        );
        Ok(())
    }

    /// Evict the least recently used bank and return its freed slot.
    fn evict_lru_tail(&mut self) -> Result<usize, NsfError> {
        let oldest = self.lru[BANK_COUNT - 1];
        if oldest == LRU_EMPTY {
            eprintln!("[pulsewave] LRU list should not have an empty tail");
            return Err(NsfError::Internal("LRU tail empty with all slots loaded"));
        }
        let oldest = oldest as u8;

        let slot = (0..BANK_COUNT)
            .find(|&i| self.slot_bank_id[i] == oldest)
            .ok_or(NsfError::Internal("LRU tail bank not in any slot"))?;

        eprintln!("[pulsewave] Evicting bank {oldest} from slot {slot}");
        self.lru[BANK_COUNT - 1] = LRU_EMPTY;
        self.slot_loaded[slot] = false;
        self.slot_bank_id[slot] = 0;

        // Any ROM slot still showing the evicted bank goes unmapped.
        for k in 0..ROM_SLOTS {
            if self.rom_block[k].is_some() && self.rom_block_bank_id[k] == oldest {
                self.rom_block[k] = None;
                self.rom_block_bank_id[k] = 0;
            }
        }
        Ok(slot)
    }

    /// Move `bank_id` to the front of the LRU list. Inserting a bank not
    /// already listed requires an empty tail: the loader evicts before it
    /// inserts.
    fn lru_touch(&mut self, bank_id: u8) -> Result<(), NsfError> {
        let id = bank_id as i16;
        if self.lru[0] == id {
            return Ok(());
        }

        if let Some(i) = self.lru.iter().position(|&b| b == id) {
            for j in (1..=i).rev() {
                self.lru[j] = self.lru[j - 1];
            }
            self.lru[0] = id;
            return Ok(());
        }

        if self.lru[BANK_COUNT - 1] != LRU_EMPTY {
            eprintln!("[pulsewave] LRU collection tail was not empty");
            return Err(NsfError::Internal("LRU tail occupied on insert"));
        }
        for j in (1..BANK_COUNT).rev() {
            self.lru[j] = self.lru[j - 1];
        }
        self.lru[0] = id;
        Ok(())
    }

    /// ROM fetch for $8000-$FFF9. Unmapped slots read as 0.
    fn rom_read(&mut self, address: u16) -> u8 {
        let block = ((address >> 12) & 7) as usize;
        match self.rom_block[block] {
            None => {
                self.unmapped_reads += 1;
                eprintln!("[pulsewave] Attempted read from unmapped ROM slot {block}");
                0
            }
            Some(base) => {
                let value = self.rom[base + (address & 0x0FFF) as usize];
                if self.banked {
                    // The mapped bank is resident, so this never inserts.
                    if self.lru_touch(self.rom_block_bank_id[block]).is_err() {
                        eprintln!("[pulsewave] LRU touch failed on ROM read");
                    }
                }
                value
            }
        }
    }
}

impl Bus for NesMemory {
    fn get_byte(&mut self, address: u16) -> u8 {
        match address {
            0x0000..=0x07FF => self.ram[address as usize],
            0x1000..=0x107F => self.stub[(address - 0x1000) as usize],
            0x4000..=0x4017 => self.apu_regs[(address - 0x4000) as usize],
            0x5FF8..=0x5FFF => self.bank_regs[(address - 0x5FF8) as usize],
            0x8000..=0xFFF9 => self.rom_read(address),
            0xFFFA..=0xFFFF => self.int_vecs[(address - 0xFFFA) as usize],
            _ => 0,
        }
    }

    fn set_byte(&mut self, address: u16, value: u8) {
        match address {
            0x0000..=0x07FF => self.ram[address as usize] = value,
            0x4000..=0x4017 => {
                self.apu_regs[(address - 0x4000) as usize] = value;
                // $4016 is the controller strobe, irrelevant to synthesis.
                if address != 0x4016 {
                    self.frame_apu_writes += 1;
                    if let Some(sink) = self.sink.as_mut() {
                        sink.write(address, value);
                    }
                }
            }
            0x5FF8..=0x5FFF => {
                let reg = (address - 0x5FF8) as usize;
                if self.bank_regs[reg] != value {
                    self.bank_regs[reg] = value;
                    if let Err(e) = self.load_bank(reg, value) {
                        eprintln!("[pulsewave] Bank switch to {value} failed: {e}");
                        if self.pending_error.is_none() {
                            self.pending_error = Some(e);
                        }
                    }
                }
            }
            // ROM and unmapped ranges: writes are dropped.
            _ => {}
        }
    }
}
