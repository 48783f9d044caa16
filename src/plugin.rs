//! Host-facing shell: the user action and the plugin entry point.
//!
//! The host registers one action (menu entry plus hotkey) and may also run the
//! plugin directly; both paths end in the same linear scan from the focus address.

use std::fmt;

use crate::database::Database;
use crate::decoder::CapstoneDecoder;
use crate::scan::{LinearScan, ScanConfig, ScanError, ScanReport};
use crate::{Architecture, Decoder};

pub const ACTION_NAME: &str = "nuclide:annotate";
pub const ACTION_LABEL: &str = "Linear decode and annotate";
pub const ACTION_HOTKEY: &str = "Alt+X";
pub const ACTION_TOOLTIP: &str =
    "Linear decode from cursor; assemble to real instructions; stop on control-flow diversion.";
pub const MENU_PATH: &str = "Edit/Plugins/";

/// Static description of a host action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDesc {
    pub name: &'static str,
    pub label: &'static str,
    pub hotkey: &'static str,
    pub tooltip: &'static str,
}

impl ActionDesc {
    /// The linear annotate action.
    pub fn annotate() -> Self {
        Self {
            name: ACTION_NAME,
            label: ACTION_LABEL,
            hotkey: ACTION_HOTKEY,
            tooltip: ACTION_TOOLTIP,
        }
    }
}

impl fmt::Display for ActionDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<20} {:<28} {:<6} {}", self.name, self.label, self.hotkey, self.tooltip)
    }
}

/// Whether the host should offer the action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    EnableForWidget,
    DisableForWidget,
}

/// Where the host keeps its actions and menus.
pub trait ActionRegistry {
    /// Register an action; false if the host refused it.
    fn register_action(&mut self, desc: ActionDesc) -> bool;

    /// Attach a registered action under `menu_path`.
    fn attach_to_menu(&mut self, menu_path: &str, action_name: &str) -> bool;
}

/// Registry that just remembers what was registered.
#[derive(Debug, Default)]
pub struct ActionList {
    pub actions: Vec<ActionDesc>,
    pub menus: Vec<(String, String)>,
}

impl ActionRegistry for ActionList {
    fn register_action(&mut self, desc: ActionDesc) -> bool {
        if self.actions.iter().any(|a| a.name == desc.name) {
            return false;
        }
        self.actions.push(desc);
        true
    }

    fn attach_to_menu(&mut self, menu_path: &str, action_name: &str) -> bool {
        if !self.actions.iter().any(|a| a.name == action_name) {
            return false;
        }
        self.menus.push((menu_path.to_string(), action_name.to_string()));
        true
    }
}

/// True if the scanner can run against a target of this architecture.
pub fn supports(architecture: Architecture) -> bool {
    architecture.is_x86()
}

/// Handler behind the annotate action.
#[derive(Debug, Default)]
pub struct AnnotateAction<C = CapstoneDecoder> {
    decoder: C,
    config: ScanConfig,
}

impl AnnotateAction<CapstoneDecoder> {
    pub fn new(config: ScanConfig) -> Self {
        Self::with_decoder(CapstoneDecoder::new(), config)
    }
}

impl<C: Decoder> AnnotateAction<C> {
    pub fn with_decoder(decoder: C, config: ScanConfig) -> Self {
        Self { decoder, config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Scan from the database focus and log the status line.
    pub fn activate<D: Database + ?Sized>(&self, db: &mut D) -> Result<ScanReport, ScanError> {
        let scan = match LinearScan::begin(db, &self.decoder, &self.config) {
            Ok(scan) => scan,
            Err(ScanError::InvalidStart(address)) => {
                log::warn!("Focus address 0x{:x} is unmapped.", address);
                return Err(ScanError::InvalidStart(address));
            }
            Err(e) => {
                log::error!("Cannot start scan: {}", e);
                return Err(e);
            }
        };

        log::info!("Decoding from 0x{:x} ...", scan.start());
        let report = scan.run();
        log::info!("{}", report.status_line());
        log::debug!("Stopped at 0x{:x}: {}", report.end, report.reason);
        Ok(report)
    }

    /// Enabled whenever the host has a focused view.
    pub fn update(&self, has_focused_view: bool) -> ActionState {
        if has_focused_view {
            ActionState::EnableForWidget
        } else {
            ActionState::DisableForWidget
        }
    }
}

/// A loaded plugin instance.
#[derive(Debug)]
pub struct Plugin<C = CapstoneDecoder> {
    action: AnnotateAction<C>,
}

impl<C: Decoder> Plugin<C> {
    /// Load against `db`: skipped (None) unless the target is x86; otherwise the
    /// action is registered and attached to the plugins menu.
    pub fn init<D, R>(db: &D, registry: &mut R, action: AnnotateAction<C>) -> Option<Self>
    where
        D: Database + ?Sized,
        R: ActionRegistry + ?Sized,
    {
        let architecture = db.architecture();
        if !supports(architecture) {
            log::info!("Skipping plugin: {} targets are not supported", architecture);
            return None;
        }

        if !registry.register_action(ActionDesc::annotate()) {
            log::warn!("Action {} was already registered", ACTION_NAME);
        }
        registry.attach_to_menu(MENU_PATH, ACTION_NAME);
        Some(Self { action })
    }

    pub fn action(&self) -> &AnnotateAction<C> {
        &self.action
    }

    /// Direct entry point; same effect as activating the action.
    pub fn run<D: Database + ?Sized>(&self, db: &mut D) -> Option<ScanReport> {
        self.action.activate(db).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{ImageDatabase, Region};
    use crate::scan::StopReason;
    use crate::testing::{code_db, ScriptedDecoder};

    #[test]
    fn test_init_registers_action_for_x86() {
        let db = code_db(0x1000, vec![0x90]);
        let mut registry = ActionList::default();
        let plugin = Plugin::init(&db, &mut registry, AnnotateAction::new(ScanConfig::default()));

        assert!(plugin.is_some());
        assert_eq!(registry.actions, vec![ActionDesc::annotate()]);
        assert_eq!(
            registry.menus,
            vec![(MENU_PATH.to_string(), ACTION_NAME.to_string())]
        );
    }

    #[test]
    fn test_init_skips_other_architectures() {
        let mut db = ImageDatabase::new(Architecture::AArch64, true);
        db.add_region(Region::new(".text", 0, vec![0; 4], true)).unwrap();
        let mut registry = ActionList::default();

        let plugin = Plugin::init(&db, &mut registry, AnnotateAction::new(ScanConfig::default()));
        assert!(plugin.is_none());
        assert!(registry.actions.is_empty());
    }

    #[test]
    fn test_registry_rejects_duplicates_and_unknown_menus() {
        let mut registry = ActionList::default();
        assert!(registry.register_action(ActionDesc::annotate()));
        assert!(!registry.register_action(ActionDesc::annotate()));
        assert!(!registry.attach_to_menu(MENU_PATH, "missing:action"));
    }

    #[test]
    fn test_run_scans_from_focus() {
        let mut db = code_db(0x1000, vec![0x90, 0xe8, 0, 0, 0, 0]);
        db.set_focus(0x1000);
        let mut registry = ActionList::default();
        let plugin = Plugin::init(
            &db,
            &mut registry,
            AnnotateAction::with_decoder(ScriptedDecoder, ScanConfig::default()),
        )
        .unwrap();

        let report = plugin.run(&mut db).unwrap();
        assert_eq!(report.reason, StopReason::Diverted);
        assert_eq!(report.end, 0x1006);
        assert_eq!(report.result.steps(), 2);
    }

    #[test]
    fn test_activate_rejects_unmapped_focus() {
        let mut db = code_db(0x1000, vec![0x90]);
        db.set_focus(0x5000);
        let action = AnnotateAction::new(ScanConfig::default());
        assert!(matches!(action.activate(&mut db), Err(ScanError::InvalidStart(0x5000))));
        assert!(db.listing().is_empty());
    }

    #[test]
    fn test_update_follows_focus() {
        let action = AnnotateAction::new(ScanConfig::default());
        assert_eq!(action.update(true), ActionState::EnableForWidget);
        assert_eq!(action.update(false), ActionState::DisableForWidget);
    }
}
