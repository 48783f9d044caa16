//! Analysis database contract and an in-memory implementation.
//!
//! [`Database`] is the narrow read/write surface the scanner needs from its
//! host. Callers hand the scan a `&mut` database, so one scan has exclusive
//! access for its whole run; serializing user-triggered scans is the host's job.

use std::collections::BTreeMap;
use std::fmt;

use crate::decoder::{CapstoneDecoder, DecodeMode};
use crate::{Address, Architecture, Decoder};

/// Errors reported by a database write
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// The range is not fully inside one mapped region
    #[error("range 0x{address:x}+{length} is not mapped")]
    Unmapped { address: Address, length: usize },

    /// A new region overlaps an existing one
    #[error("region '{name}' at 0x{start:x} overlaps an existing region")]
    RegionOverlap { name: String, start: Address },

    /// A new region extends past the top of the address space
    #[error("region '{name}' at 0x{start:x} with size 0x{size:x} wraps the address space")]
    AddressOverflow { name: String, start: Address, size: usize },
}

/// Everything the scanner reads from and writes to its host database.
pub trait Database {
    /// True if `address` belongs to any region.
    fn is_mapped(&self, address: Address) -> bool;

    /// Copy up to `buf.len()` bytes starting at `address`; returns how many were copied.
    /// Zero means nothing is readable there.
    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> usize;

    /// End (exclusive) of the region containing `address`, if the database knows it.
    fn region_end(&self, address: Address) -> Option<Address>;

    /// Address the user is currently looking at.
    fn focus_address(&self) -> Address;

    /// Bitness of the target.
    fn is_64bit(&self) -> bool;

    /// Processor family of the target.
    fn architecture(&self) -> Architecture;

    /// Remove every item overlapping `[address, address + length)`.
    fn delete_items(&mut self, address: Address, length: usize) -> Result<(), DatabaseError>;

    /// Create an instruction item at `address` using the database's own decoding.
    fn create_instruction(&mut self, address: Address) -> bool;

    /// Override the displayed text of the item at `address`.
    fn force_display_text(&mut self, address: Address, text: &str);

    /// Set (not append) the comment at `address`.
    fn attach_comment(&mut self, address: Address, text: &str, repeatable: bool);
}

/// A contiguous mapped range in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    /// Region name
    pub name: String,
    /// Starting address of the region
    pub start: Address,
    /// Mapped size in bytes; may exceed `bytes.len()` for zero-fill regions
    pub size: usize,
    /// Whether this region contains executable code
    pub executable: bool,
    /// Initialized contents
    pub bytes: Vec<u8>,
}

impl Region {
    /// Create a region whose mapped size equals its contents.
    pub fn new(name: impl Into<String>, start: Address, bytes: Vec<u8>, executable: bool) -> Self {
        Self {
            name: name.into(),
            start,
            size: bytes.len(),
            executable,
            bytes,
        }
    }

    /// Grow the mapped size beyond the initialized bytes.
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size.max(self.bytes.len());
        self
    }

    /// Get the end address of this region, clamped to the top of the address space
    pub fn end_address(&self) -> Address {
        self.start.saturating_add(self.size as Address)
    }

    pub fn contains(&self, address: Address) -> bool {
        address >= self.start && address < self.end_address()
    }
}

/// What an item is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Instruction,
    Data,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemKind::Instruction => write!(f, "instruction"),
            ItemKind::Data => write!(f, "data"),
        }
    }
}

/// A defined item occupying `length` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub kind: ItemKind,
    pub length: usize,
    /// Forced display text, if any
    pub display: Option<String>,
}

/// One line of the database listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub address: Address,
    /// `None` for a bare comment with no item at its address
    pub kind: Option<ItemKind>,
    pub length: usize,
    pub text: Option<String>,
    pub comment: Option<String>,
}

/// In-memory database over a set of regions.
#[derive(Debug)]
pub struct ImageDatabase {
    architecture: Architecture,
    is_64bit: bool,
    focus: Address,
    regions: Vec<Region>,
    items: BTreeMap<Address, Item>,
    comments: BTreeMap<Address, String>,
    repeatable_comments: BTreeMap<Address, String>,
    decoder: CapstoneDecoder,
}

impl ImageDatabase {
    /// Create an empty database for `architecture`.
    pub fn new(architecture: Architecture, is_64bit: bool) -> Self {
        Self {
            architecture,
            is_64bit,
            focus: 0,
            regions: Vec::new(),
            items: BTreeMap::new(),
            comments: BTreeMap::new(),
            repeatable_comments: BTreeMap::new(),
            decoder: CapstoneDecoder::new(),
        }
    }

    /// Map a region. Regions may not overlap, and must end at or below `u64::MAX`.
    pub fn add_region(&mut self, region: Region) -> Result<(), DatabaseError> {
        if region.start.checked_add(region.size as Address).is_none() {
            return Err(DatabaseError::AddressOverflow {
                name: region.name,
                start: region.start,
                size: region.size,
            });
        }
        let overlaps = self
            .regions
            .iter()
            .any(|r| region.start < r.end_address() && r.start < region.end_address());
        if overlaps {
            return Err(DatabaseError::RegionOverlap {
                name: region.name,
                start: region.start,
            });
        }
        log::debug!(
            "Mapped region '{}' at 0x{:x} ({} bytes, {} initialized)",
            region.name,
            region.start,
            region.size,
            region.bytes.len()
        );
        self.regions.push(region);
        self.regions.sort_by_key(|r| r.start);
        Ok(())
    }

    pub fn set_focus(&mut self, address: Address) {
        self.focus = address;
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Find the region containing `address`
    pub fn region_at(&self, address: Address) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(address))
    }

    /// The item starting at `address`, if any.
    pub fn item_at(&self, address: Address) -> Option<&Item> {
        self.items.get(&address)
    }

    /// The comment at `address`, regular or repeatable.
    pub fn comment_at(&self, address: Address, repeatable: bool) -> Option<&str> {
        let map = if repeatable {
            &self.repeatable_comments
        } else {
            &self.comments
        };
        map.get(&address).map(String::as_str)
    }

    /// Define a data item; fails on unmapped or already-occupied ranges.
    pub fn define_data(&mut self, address: Address, length: usize) -> bool {
        if length == 0 || !self.range_mapped(address, length) || self.overlaps_item(address, length) {
            return false;
        }
        self.items.insert(
            address,
            Item {
                kind: ItemKind::Data,
                length,
                display: None,
            },
        );
        true
    }

    /// Items and comments in address order.
    pub fn listing(&self) -> Vec<ListingEntry> {
        let mut entries: BTreeMap<Address, ListingEntry> = self
            .items
            .iter()
            .map(|(&address, item)| {
                (
                    address,
                    ListingEntry {
                        address,
                        kind: Some(item.kind),
                        length: item.length,
                        text: item.display.clone(),
                        comment: None,
                    },
                )
            })
            .collect();

        for (&address, text) in self.comments.iter().chain(self.repeatable_comments.iter()) {
            let entry = entries.entry(address).or_insert_with(|| ListingEntry {
                address,
                kind: None,
                length: 0,
                text: None,
                comment: None,
            });
            match &mut entry.comment {
                Some(existing) => {
                    existing.push_str("; ");
                    existing.push_str(text);
                }
                None => entry.comment = Some(text.clone()),
            }
        }

        entries.into_values().collect()
    }

    fn range_mapped(&self, address: Address, length: usize) -> bool {
        self.region_at(address)
            .and_then(|r| {
                address
                    .checked_add(length as Address)
                    .map(|end| end <= r.end_address())
            })
            .unwrap_or(false)
    }

    fn overlaps_item(&self, address: Address, length: usize) -> bool {
        let end = address.saturating_add(length as Address);
        // Items never overlap each other, so the last one starting before `end` decides.
        self.items
            .range(..end)
            .next_back()
            .map(|(&start, item)| start.saturating_add(item.length as Address) > address)
            .unwrap_or(false)
    }
}

impl Database for ImageDatabase {
    fn is_mapped(&self, address: Address) -> bool {
        self.region_at(address).is_some()
    }

    fn read_bytes(&self, address: Address, buf: &mut [u8]) -> usize {
        let Some(region) = self.region_at(address) else {
            return 0;
        };
        let offset = (address - region.start) as usize;
        if offset >= region.bytes.len() {
            return 0;
        }
        let n = buf.len().min(region.bytes.len() - offset);
        buf[..n].copy_from_slice(&region.bytes[offset..offset + n]);
        n
    }

    fn region_end(&self, address: Address) -> Option<Address> {
        self.region_at(address).map(Region::end_address)
    }

    fn focus_address(&self) -> Address {
        self.focus
    }

    fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    fn architecture(&self) -> Architecture {
        self.architecture
    }

    fn delete_items(&mut self, address: Address, length: usize) -> Result<(), DatabaseError> {
        if !self.range_mapped(address, length) {
            return Err(DatabaseError::Unmapped { address, length });
        }
        let end = address.saturating_add(length as Address);
        let doomed: Vec<Address> = self
            .items
            .range(..end)
            .filter(|(start, item)| start.saturating_add(item.length as Address) > address)
            .map(|(&start, _)| start)
            .collect();
        for start in doomed {
            self.items.remove(&start);
        }
        Ok(())
    }

    fn create_instruction(&mut self, address: Address) -> bool {
        if !self.architecture.is_x86() {
            return false;
        }
        match self.region_at(address) {
            Some(region) if region.executable => {}
            _ => return false,
        }

        let mut window = [0u8; 16];
        let got = self.read_bytes(address, &mut window);
        let mode = DecodeMode::from_bitness(self.is_64bit);
        let length = match self.decoder.decode(&window[..got], address, mode) {
            Ok(insn) => insn.size as usize,
            Err(e) => {
                log::debug!("Database cannot create instruction at 0x{:x}: {}", address, e);
                return false;
            }
        };

        if !self.range_mapped(address, length) || self.overlaps_item(address, length) {
            return false;
        }
        self.items.insert(
            address,
            Item {
                kind: ItemKind::Instruction,
                length,
                display: None,
            },
        );
        true
    }

    fn force_display_text(&mut self, address: Address, text: &str) {
        match self.items.get_mut(&address) {
            Some(item) => item.display = Some(text.to_string()),
            None => log::debug!("No item at 0x{:x} to override", address),
        }
    }

    fn attach_comment(&mut self, address: Address, text: &str, repeatable: bool) {
        let map = if repeatable {
            &mut self.repeatable_comments
        } else {
            &mut self.comments
        };
        map.insert(address, text.to_string());
    }
}
