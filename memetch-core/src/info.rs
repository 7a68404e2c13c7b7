//! Decoding of the driver's device info reply.
//!
//! The `GET_INFO` control request fills a fixed little-endian structure whose
//! layout is part of the kernel ABI:
//!
//! | field                 | type        |
//! |-----------------------|-------------|
//! | `CR3`                 | `u64`       |
//! | `NtBuildNumber`       | `u64`       |
//! | `KernelBase`          | `u64`       |
//! | `KDBG`                | `u64`       |
//! | `KPCR`                | `[u64; 64]` |
//! | `PfnDataBase`         | `u64`       |
//! | `PsLoadedModuleList`  | `u64`       |
//! | `PsActiveProcessHead` | `u64`       |
//! | `NtBuildNumberAddr`   | `u64`       |
//! | `Padding`             | `[u64; 254]`|
//! | `NumberOfRuns`        | `u64`       |
//! | `Run`                 | `[{BaseAddress: u64, NumberOfBytes: u64}; 20]` |

use crate::error::{Error, Result};
use crate::PAGE_SIZE;
use serde::{Serialize, Serializer};
use std::fmt;

/// Number of run slots in the driver reply. Fixed by the driver ABI.
pub const NUMBER_OF_RUNS: usize = 20;
/// Number of per-CPU `KPCR` slots in the driver reply.
pub const KPCR_SLOTS: usize = 64;
const PADDING_WORDS: usize = 0xfe;

const KPCR_OFFSET: usize = 4 * 8;
const PFN_DATABASE_OFFSET: usize = KPCR_OFFSET + KPCR_SLOTS * 8;
const NT_BUILD_NUMBER_ADDR_OFFSET: usize = PFN_DATABASE_OFFSET + 3 * 8;
const NUMBER_OF_RUNS_OFFSET: usize = NT_BUILD_NUMBER_ADDR_OFFSET + 8 + PADDING_WORDS * 8;
const RUNS_OFFSET: usize = NUMBER_OF_RUNS_OFFSET + 8;

/// Size in bytes of the fixed device info structure.
pub const MEMORY_INFO_SIZE: usize = RUNS_OFFSET + NUMBER_OF_RUNS * 16;

/// One physically backed region as reported by the driver.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MemoryRange {
    #[serde(rename = "BaseAddress", serialize_with = "hex")]
    pub base_address: u64,
    #[serde(rename = "NumberOfBytes", serialize_with = "hex")]
    pub length_bytes: u64,
}

impl MemoryRange {
    pub fn new(base_address: u64, length_bytes: u64) -> Self {
        Self {
            base_address,
            length_bytes,
        }
    }

    /// First address past the end of the range, clamped to the top of the
    /// address space.
    pub fn end(&self) -> u64 {
        self.base_address.saturating_add(self.length_bytes)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.base_address <= offset && offset < self.end()
    }
}

/// The raw driver reply, field for field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMemoryInfo {
    pub cr3: u64,
    pub nt_build_number: u64,
    pub kernel_base: u64,
    pub kdbg: u64,
    pub kpcr: [u64; KPCR_SLOTS],
    pub pfn_database: u64,
    pub ps_loaded_module_list: u64,
    pub ps_active_process_head: u64,
    pub nt_build_number_addr: u64,
    pub number_of_runs: u64,
    pub runs: [MemoryRange; NUMBER_OF_RUNS],
}

impl Default for RawMemoryInfo {
    fn default() -> Self {
        Self {
            cr3: 0,
            nt_build_number: 0,
            kernel_base: 0,
            kdbg: 0,
            kpcr: [0; KPCR_SLOTS],
            pfn_database: 0,
            ps_loaded_module_list: 0,
            ps_active_process_head: 0,
            nt_build_number_addr: 0,
            number_of_runs: 0,
            runs: [MemoryRange::default(); NUMBER_OF_RUNS],
        }
    }
}

fn read_u64(raw: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&raw[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn put_u64(raw: &mut [u8], offset: usize, value: u64) {
    raw[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

impl RawMemoryInfo {
    /// Parses the fixed structure from the start of `raw`.
    ///
    /// Bytes past [`MEMORY_INFO_SIZE`] are ignored; the driver is handed a
    /// much larger scratch buffer than it fills.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < MEMORY_INFO_SIZE {
            return Err(Error::Decode {
                expected: MEMORY_INFO_SIZE,
                actual: raw.len(),
            });
        }

        let mut info = RawMemoryInfo {
            cr3: read_u64(raw, 0),
            nt_build_number: read_u64(raw, 8),
            kernel_base: read_u64(raw, 16),
            kdbg: read_u64(raw, 24),
            pfn_database: read_u64(raw, PFN_DATABASE_OFFSET),
            ps_loaded_module_list: read_u64(raw, PFN_DATABASE_OFFSET + 8),
            ps_active_process_head: read_u64(raw, PFN_DATABASE_OFFSET + 16),
            nt_build_number_addr: read_u64(raw, NT_BUILD_NUMBER_ADDR_OFFSET),
            number_of_runs: read_u64(raw, NUMBER_OF_RUNS_OFFSET),
            ..Default::default()
        };

        for (slot, kpcr) in info.kpcr.iter_mut().enumerate() {
            *kpcr = read_u64(raw, KPCR_OFFSET + slot * 8);
        }
        for (slot, run) in info.runs.iter_mut().enumerate() {
            let offset = RUNS_OFFSET + slot * 16;
            *run = MemoryRange::new(read_u64(raw, offset), read_u64(raw, offset + 8));
        }

        Ok(info)
    }

    /// Serializes back to the driver layout. Padding is zero.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = vec![0u8; MEMORY_INFO_SIZE];
        put_u64(&mut raw, 0, self.cr3);
        put_u64(&mut raw, 8, self.nt_build_number);
        put_u64(&mut raw, 16, self.kernel_base);
        put_u64(&mut raw, 24, self.kdbg);
        for (slot, kpcr) in self.kpcr.iter().enumerate() {
            put_u64(&mut raw, KPCR_OFFSET + slot * 8, *kpcr);
        }
        put_u64(&mut raw, PFN_DATABASE_OFFSET, self.pfn_database);
        put_u64(&mut raw, PFN_DATABASE_OFFSET + 8, self.ps_loaded_module_list);
        put_u64(&mut raw, PFN_DATABASE_OFFSET + 16, self.ps_active_process_head);
        put_u64(&mut raw, NT_BUILD_NUMBER_ADDR_OFFSET, self.nt_build_number_addr);
        put_u64(&mut raw, NUMBER_OF_RUNS_OFFSET, self.number_of_runs);
        for (slot, run) in self.runs.iter().enumerate() {
            let offset = RUNS_OFFSET + slot * 16;
            put_u64(&mut raw, offset, run.base_address);
            put_u64(&mut raw, offset + 8, run.length_bytes);
        }
        raw
    }

    /// Returns run slot `index`, or `None` past the fixed slot capacity.
    pub fn run_slot(&self, index: usize) -> Option<MemoryRange> {
        if index < NUMBER_OF_RUNS {
            Some(self.runs[index])
        } else {
            None
        }
    }

    /// Number of run slots that hold valid ranges.
    pub fn valid_runs(&self) -> usize {
        usize::try_from(self.number_of_runs)
            .unwrap_or(usize::MAX)
            .min(NUMBER_OF_RUNS)
    }

    /// Builds the domain model, dropping empty `KPCR` slots and unused runs.
    pub fn into_info(self) -> DeviceInfo {
        let kpcr = self.kpcr.iter().copied().filter(|&kpcr| kpcr != 0).collect();
        let ranges = (0..self.valid_runs())
            .map_while(|index| self.run_slot(index))
            .collect();

        DeviceInfo {
            cr3: self.cr3,
            nt_build_number: self.nt_build_number,
            kernel_base: self.kernel_base,
            kpcr,
            nt_build_number_addr: self.nt_build_number_addr,
            ranges,
        }
    }
}

/// What the driver knows about the machine, decoded once per session.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    #[serde(rename = "CR3", serialize_with = "hex")]
    pub cr3: u64,
    #[serde(rename = "NtBuildNumber", serialize_with = "hex")]
    pub nt_build_number: u64,
    #[serde(rename = "KernelBase", serialize_with = "hex")]
    pub kernel_base: u64,
    #[serde(rename = "KPCR", serialize_with = "hex_seq")]
    pub kpcr: Vec<u64>,
    #[serde(rename = "NtBuildNumberAddr", serialize_with = "hex")]
    pub nt_build_number_addr: u64,
    #[serde(rename = "Run")]
    pub ranges: Vec<MemoryRange>,
}

impl DeviceInfo {
    /// Decodes a raw `GET_INFO` reply.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        Ok(RawMemoryInfo::parse(raw)?.into_info())
    }

    /// Size of an uncompressed image: the end of the last reported range.
    pub fn image_size(&self) -> u64 {
        self.ranges.last().map_or(0, MemoryRange::end)
    }

    /// Number of pages an uncompressed image covers, gaps included.
    pub fn image_pages(&self) -> u64 {
        self.image_size() / PAGE_SIZE as u64
    }

    /// Pretty JSON form of the report.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Io(e.into()))
    }
}

/// Renders the key/value report shown to the user before imaging.
impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CR3: {:#x}", self.cr3)?;
        writeln!(f, "NtBuildNumber: {:#x}", self.nt_build_number)?;
        writeln!(f, "KernelBase: {:#x}", self.kernel_base)?;
        if self.kpcr.is_empty() {
            writeln!(f, "KPCR: []")?;
        } else {
            writeln!(f, "KPCR:")?;
            for kpcr in &self.kpcr {
                writeln!(f, "- {kpcr:#x}")?;
            }
        }
        writeln!(f, "NtBuildNumberAddr: {:#x}", self.nt_build_number_addr)?;
        if self.ranges.is_empty() {
            writeln!(f, "Run: []")
        } else {
            writeln!(f, "Run:")?;
            for range in &self.ranges {
                writeln!(f, "- BaseAddress: {:#x}", range.base_address)?;
                writeln!(f, "  NumberOfBytes: {:#x}", range.length_bytes)?;
            }
            Ok(())
        }
    }
}

fn hex<S: Serializer>(value: &u64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(&format_args!("{value:#x}"))
}

fn hex_seq<S: Serializer>(values: &[u64], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(values.iter().map(|value| format!("{value:#x}")))
}
