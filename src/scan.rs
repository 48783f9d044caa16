//! Linear scan controller.
//!
//! Decodes forward from a start address, materializing every instruction,
//! until an instruction diverts control flow, the cursor leaves readable
//! memory, or the scan limit is reached.
//!
//! Per step:
//! - read/decode failure: counted as undecoded, cursor advances by one byte
//! - format/materialize failure: counted as undecoded, cursor advances by the
//!   decoded length (the bytes were a valid instruction)
//! - success: counted as real or annotated, cursor advances by the decoded length

use std::fmt;
use std::ops::ControlFlow;

use serde::{Deserialize, Serialize};

use crate::database::{Database, DatabaseError};
use crate::decoder::{self, DecodeMode, DecoderError};
use crate::materialize::{materialize, Materialized};
use crate::{Address, Decoder};

/// Prefix of the status line printed after each scan
pub const STATUS_PREFIX: &str = "annotate";

/// Tunables for one scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Bytes read per decode attempt
    pub window_size: usize,
    /// Scan span when the start address has no enclosing region
    pub safety_span: u64,
    /// Longest rendered text accepted
    pub max_text_len: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            window_size: 16,
            safety_span: 0x2000,
            max_text_len: 128,
        }
    }
}

impl ScanConfig {
    /// Parse a JSON config; missing fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ScanError> {
        if self.window_size == 0 {
            return Err(ScanError::InvalidConfig("window_size must be at least 1".into()));
        }
        if self.safety_span == 0 {
            return Err(ScanError::InvalidConfig("safety_span must be at least 1".into()));
        }
        if self.max_text_len == 0 {
            return Err(ScanError::InvalidConfig("max_text_len must be at least 1".into()));
        }
        Ok(())
    }
}

/// Scan errors. Only `InvalidStart`, `InvalidConfig` and `Decoder` stop a scan
/// from starting; the rest are per-step and only counted.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("start address 0x{0:x} is not mapped")]
    InvalidStart(Address),

    #[error("invalid scan configuration: {0}")]
    InvalidConfig(String),

    #[error("decoder initialization failed: {0}")]
    Decoder(#[from] DecoderError),

    #[error("no bytes readable at 0x{0:x}")]
    ReadFailure(Address),

    #[error("cannot decode at 0x{address:x}: {source}")]
    DecodeFailure {
        address: Address,
        #[source]
        source: DecoderError,
    },

    #[error("cannot render instruction at 0x{address:x}: {source}")]
    FormatFailure {
        address: Address,
        #[source]
        source: DecoderError,
    },

    #[error("cannot materialize instruction at 0x{address:x}: {source}")]
    MaterializeFailure {
        address: Address,
        #[source]
        source: DatabaseError,
    },
}

/// Why a scan stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The last materialized instruction diverts control flow
    Diverted,
    /// The cursor reached an unmapped address before the limit
    BytesExhausted,
    /// The cursor reached the scan limit
    BoundaryReached,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Diverted => write!(f, "control flow diverted"),
            StopReason::BytesExhausted => write!(f, "bytes exhausted"),
            StopReason::BoundaryReached => write!(f, "boundary reached"),
        }
    }
}

/// Per-outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Materialized as real instructions
    pub real: usize,
    /// Materialized as comments only
    pub annotated: usize,
    /// Steps that produced nothing usable
    pub undecoded: usize,
}

impl ScanResult {
    pub fn steps(&self) -> usize {
        self.real + self.annotated + self.undecoded
    }
}

/// Final summary of one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub start: Address,
    pub limit: Address,
    /// Cursor after the last step
    pub end: Address,
    pub mode: DecodeMode,
    pub result: ScanResult,
    pub reason: StopReason,
}

impl ScanReport {
    /// One-line summary: start address and the three counters.
    pub fn status_line(&self) -> String {
        format!(
            "{}: from 0x{:x} code:{} manual:{} undecoded:{}",
            STATUS_PREFIX, self.start, self.result.real, self.result.annotated, self.result.undecoded
        )
    }
}

impl fmt::Display for ScanReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} at 0x{:x})", self.status_line(), self.reason, self.end)
    }
}

/// An in-progress linear scan over `db`.
pub struct LinearScan<'a, D: ?Sized, C: ?Sized> {
    db: &'a mut D,
    decoder: &'a C,
    config: &'a ScanConfig,
    mode: DecodeMode,
    start: Address,
    limit: Address,
    cursor: Address,
    result: ScanResult,
    stopped: Option<StopReason>,
}

impl<'a, D, C> LinearScan<'a, D, C>
where
    D: Database + ?Sized,
    C: Decoder + ?Sized,
{
    /// Start a scan at the database's focus address.
    pub fn begin(db: &'a mut D, decoder: &'a C, config: &'a ScanConfig) -> Result<Self, ScanError> {
        let start = db.focus_address();
        Self::begin_at(db, decoder, config, start)
    }

    /// Start a scan at `start`. Nothing is written to `db` if this fails.
    pub fn begin_at(
        db: &'a mut D,
        decoder: &'a C,
        config: &'a ScanConfig,
        start: Address,
    ) -> Result<Self, ScanError> {
        config.validate()?;
        decoder.initialize()?;

        if !db.is_mapped(start) {
            return Err(ScanError::InvalidStart(start));
        }

        let limit = db
            .region_end(start)
            .unwrap_or_else(|| start.saturating_add(config.safety_span));
        let mode = DecodeMode::from_bitness(db.is_64bit());

        log::debug!(
            "Linear scan from 0x{:x} to 0x{:x} in {} mode",
            start,
            limit,
            mode
        );

        Ok(Self {
            db,
            decoder,
            config,
            mode,
            start,
            limit,
            cursor: start,
            result: ScanResult::default(),
            stopped: None,
        })
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn cursor(&self) -> Address {
        self.cursor
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    pub fn result(&self) -> ScanResult {
        self.result
    }

    /// Run one step. `Break` carries the stop reason; stepping a stopped scan
    /// returns the same reason again without touching the database.
    pub fn step(&mut self) -> ControlFlow<StopReason> {
        if let Some(reason) = self.stopped {
            return ControlFlow::Break(reason);
        }

        if self.cursor >= self.limit {
            return self.stop(StopReason::BoundaryReached);
        }
        if !self.db.is_mapped(self.cursor) {
            return self.stop(StopReason::BytesExhausted);
        }

        let at = self.cursor;
        let insn = match decoder::decode_at(&*self.db, self.decoder, at, self.mode, self.config.window_size) {
            Ok(insn) => insn,
            Err(e) => {
                log::debug!("{}", e);
                self.result.undecoded += 1;
                self.cursor = at.saturating_add(1);
                return ControlFlow::Continue(());
            }
        };

        let length = insn.size as usize;
        let diverts = insn.diverts();

        match self.commit(&insn, at) {
            Ok(Materialized::Real) => self.result.real += 1,
            Ok(Materialized::Annotated) => self.result.annotated += 1,
            Err(e) => {
                log::debug!("{}", e);
                self.result.undecoded += 1;
            }
        }

        self.cursor = at.saturating_add(length as Address);

        if diverts {
            log::debug!("0x{:x}: {} diverts control flow", at, insn.category);
            return self.stop(StopReason::Diverted);
        }
        ControlFlow::Continue(())
    }

    /// Step until the scan stops and report.
    pub fn run(mut self) -> ScanReport {
        let reason = loop {
            if let ControlFlow::Break(reason) = self.step() {
                break reason;
            }
        };
        self.report(reason)
    }

    fn commit(
        &mut self,
        insn: &crate::DecodedInstruction,
        at: Address,
    ) -> Result<Materialized, ScanError> {
        let text = self
            .decoder
            .format(insn, at, self.config.max_text_len)
            .map_err(|source| ScanError::FormatFailure { address: at, source })?;

        let outcome = materialize(&mut *self.db, at, insn.size as usize, &text)
            .map_err(|source| ScanError::MaterializeFailure { address: at, source })?;

        log::debug!("0x{:x}: {:<40} [{}]", at, text, outcome);
        Ok(outcome)
    }

    fn stop(&mut self, reason: StopReason) -> ControlFlow<StopReason> {
        self.stopped = Some(reason);
        ControlFlow::Break(reason)
    }

    fn report(&self, reason: StopReason) -> ScanReport {
        ScanReport {
            start: self.start,
            limit: self.limit,
            end: self.cursor,
            mode: self.mode,
            result: self.result,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ImageDatabase, ItemKind, Region};
    use crate::decoder::CapstoneDecoder;
    use crate::testing::{code_db, ScriptedDecoder, UnmappedRegionsDb};
    use crate::Architecture;
    use rstest::rstest;

    fn scan(db: &mut ImageDatabase, start: Address) -> ScanReport {
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();
        LinearScan::begin_at(db, &decoder, &config, start).unwrap().run()
    }

    #[test]
    fn test_nop_advances_one_byte_and_continues() {
        let mut db = code_db(0x1000, vec![0x90, 0x90, 0xc3]);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();
        let mut scan = LinearScan::begin_at(&mut db, &decoder, &config, 0x1000).unwrap();

        assert_eq!(scan.step(), ControlFlow::Continue(()));
        assert_eq!(scan.cursor(), 0x1001);
        assert_eq!(scan.result().real, 1);
    }

    #[test]
    fn test_call_stops_after_one_step() {
        let mut db = code_db(0x1000, vec![0xe8, 0x00, 0x00, 0x00, 0x00, 0x90, 0x90]);
        let report = scan(&mut db, 0x1000);

        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 0x1005);
        assert_eq!(report.result, ScanResult { real: 1, annotated: 0, undecoded: 0 });
        assert_eq!(
            db.item_at(0x1000).and_then(|i| i.display.as_deref()),
            Some("call 0x1005")
        );
        // Nothing past the call was touched
        assert!(db.item_at(0x1005).is_none());
    }

    #[test]
    fn test_unconditional_jump_stops_after_one_step() {
        let mut db = code_db(0x1000, vec![0xeb, 0xfe, 0x90]);
        let report = scan(&mut db, 0x1000);
        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 0x1002);
        assert_eq!(report.result.steps(), 1);
    }

    #[rstest]
    #[case::loop_(0xe2)]
    #[case::loope(0xe1)]
    #[case::loopne(0xe0)]
    #[case::jrcxz(0xe3)]
    fn test_counter_branch_stops_after_one_step(#[case] opcode: u8) {
        let mut db = code_db(0x1000, vec![opcode, 0x00, 0x90, 0x90, 0xc3]);
        let report = scan(&mut db, 0x1000);

        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 0x1002);
        assert_eq!(report.result, ScanResult { real: 1, annotated: 0, undecoded: 0 });
        assert!(db.item_at(0x1002).is_none());
    }

    #[test]
    fn test_runs_until_diverting_instruction() {
        // push rbp; mov rbp, rsp; nop; ret
        let code = vec![0x55, 0x48, 0x89, 0xe5, 0x90, 0xc3, 0x90];
        let mut db = code_db(0x1000, code);
        let report = scan(&mut db, 0x1000);

        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 0x1000 + 5 + 1);
        assert_eq!(report.result.real, 4);
        assert_eq!(report.result.steps(), 4);
        assert_eq!(db.item_at(0x1005).map(|i| i.kind), Some(ItemKind::Instruction));
    }

    #[test]
    fn test_boundary_reached_at_region_end() {
        let mut db = code_db(0x1000, vec![0x90; 4]);
        let report = scan(&mut db, 0x1000);
        assert_eq!(report.reason, StopReason::BoundaryReached);
        assert_eq!(report.limit, 0x1004);
        assert_eq!(report.end, 0x1004);
        assert_eq!(report.result.real, 4);
    }

    #[test]
    fn test_uninitialized_bytes_are_undecoded_one_at_a_time() {
        let mut db = ImageDatabase::new(Architecture::X86_64, true);
        db.add_region(Region::new(".text", 0x1000, vec![0x90], true).with_size(4))
            .unwrap();
        let report = scan(&mut db, 0x1000);

        assert_eq!(report.reason, StopReason::BoundaryReached);
        assert_eq!(report.result, ScanResult { real: 1, annotated: 0, undecoded: 3 });
    }

    #[test]
    fn test_non_executable_region_is_annotated() {
        let mut db = ImageDatabase::new(Architecture::X86_64, true);
        db.add_region(Region::new(".data", 0x4000, vec![0x90, 0xc3], false))
            .unwrap();
        let report = scan(&mut db, 0x4000);

        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.result, ScanResult { real: 0, annotated: 2, undecoded: 0 });
        assert_eq!(db.comment_at(0x4001, false), Some("ret"));
    }

    #[test]
    fn test_unmapped_start_is_rejected_without_mutation() {
        let mut db = code_db(0x1000, vec![0x90]);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();

        let err = LinearScan::begin_at(&mut db, &decoder, &config, 0x8000).err();
        assert!(matches!(err, Some(ScanError::InvalidStart(0x8000))));
        assert!(db.listing().is_empty());
    }

    #[test]
    fn test_begin_uses_focus_address() {
        let mut db = code_db(0x1000, vec![0x90, 0xc3]);
        db.set_focus(0x1001);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();
        let report = LinearScan::begin(&mut db, &decoder, &config).unwrap().run();
        assert_eq!(report.start, 0x1001);
        assert_eq!(report.result.real, 1);
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let code = vec![0x55, 0x48, 0x89, 0xe5, 0xe8, 0x00, 0x00, 0x00, 0x00];
        let mut db = code_db(0x1000, code);

        let first = scan(&mut db, 0x1000);
        let listing = db.listing();
        let second = scan(&mut db, 0x1000);

        assert_eq!(first, second);
        assert_eq!(listing, db.listing());
    }

    #[test]
    fn test_scripted_decode_failure_advances_one_byte() {
        let mut db = code_db(0x1000, vec![0xff, 0x90, 0xc3]);
        let decoder = ScriptedDecoder;
        let config = ScanConfig::default();
        let mut scan = LinearScan::begin_at(&mut db, &decoder, &config, 0x1000).unwrap();

        assert_eq!(scan.step(), ControlFlow::Continue(()));
        assert_eq!(scan.cursor(), 0x1001);
        assert_eq!(scan.result(), ScanResult { real: 0, annotated: 0, undecoded: 1 });

        let report = scan.run();
        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 0x1003);
        assert_eq!(report.result, ScanResult { real: 2, annotated: 0, undecoded: 1 });
    }

    #[test]
    fn test_format_failure_advances_by_decoded_length() {
        // 0xf1 is scripted as a 3-byte instruction that cannot be rendered
        let mut db = code_db(0x1000, vec![0xf1, 0x00, 0x00, 0xc3]);
        let decoder = ScriptedDecoder;
        let config = ScanConfig::default();
        let mut scan = LinearScan::begin_at(&mut db, &decoder, &config, 0x1000).unwrap();

        assert_eq!(scan.step(), ControlFlow::Continue(()));
        assert_eq!(scan.cursor(), 0x1003);
        assert_eq!(scan.result(), ScanResult { real: 0, annotated: 0, undecoded: 1 });

        let report = scan.run();
        assert_eq!(report.result, ScanResult { real: 1, annotated: 0, undecoded: 1 });
        assert!(db.item_at(0x1000).is_none());
        assert!(db.comment_at(0x1000, false).is_none());
    }

    #[test]
    fn test_safety_span_bounds_regionless_scans() {
        let mut db = UnmappedRegionsDb::new(vec![0x90; 0x40]);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig {
            safety_span: 0x10,
            ..ScanConfig::default()
        };
        let report = LinearScan::begin_at(&mut db, &decoder, &config, 0)
            .unwrap()
            .run();

        assert_eq!(report.limit, 0x10);
        assert_eq!(report.reason, StopReason::BoundaryReached);
        assert_eq!(report.result.annotated, 0x10);
    }

    #[test]
    fn test_materialize_failure_counts_undecoded_and_advances() {
        let mut db = UnmappedRegionsDb::new(vec![0x90, 0x90, 0xc3]);
        db.fail_deletes = true;
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();
        let report = LinearScan::begin_at(&mut db, &decoder, &config, 0)
            .unwrap()
            .run();

        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 3);
        assert_eq!(report.result, ScanResult { real: 0, annotated: 0, undecoded: 3 });
    }

    #[test]
    fn test_bytes_exhausted_when_cursor_leaves_mapping() {
        let mut db = UnmappedRegionsDb::new(vec![0x90, 0x90]);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();
        let report = LinearScan::begin_at(&mut db, &decoder, &config, 0)
            .unwrap()
            .run();
        assert_eq!(report.reason, StopReason::BytesExhausted);
        assert_eq!(report.end, 2);
    }

    #[test]
    fn test_stopped_scan_stays_stopped() {
        let mut db = code_db(0x1000, vec![0xc3, 0x90]);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig::default();
        let mut scan = LinearScan::begin_at(&mut db, &decoder, &config, 0x1000).unwrap();
        assert_eq!(scan.step(), ControlFlow::Break(StopReason::Diverted));
        assert_eq!(scan.step(), ControlFlow::Break(StopReason::Diverted));
        assert_eq!(scan.cursor(), 0x1001);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut db = code_db(0x1000, vec![0x90]);
        let decoder = CapstoneDecoder::new();
        let config = ScanConfig {
            window_size: 0,
            ..ScanConfig::default()
        };
        assert!(matches!(
            LinearScan::begin_at(&mut db, &decoder, &config, 0x1000).err(),
            Some(ScanError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_config_from_json_keeps_defaults() {
        let config = ScanConfig::from_json(r#"{ "safety_span": 4096 }"#).unwrap();
        assert_eq!(config.safety_span, 4096);
        assert_eq!(config.window_size, 16);
        assert_eq!(config.max_text_len, 128);
    }

    #[test]
    fn test_status_line() {
        let report = ScanReport {
            start: 0x401000,
            limit: 0x402000,
            end: 0x401010,
            mode: DecodeMode::Long64,
            result: ScanResult { real: 3, annotated: 1, undecoded: 2 },
            reason: StopReason::Diverted,
        };
        assert_eq!(
            report.status_line(),
            "annotate: from 0x401000 code:3 manual:1 undecoded:2"
        );
    }
}
