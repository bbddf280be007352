//! # Memory Scan Engine
//!
//! Progressive value search over the target's writable memory.
//!
//! A scan session works like a classic cheat-engine search:
//!
//! 1. [`ScanEngine::first_scan`] walks every writable range for the
//!    little-endian encoding of a value and records every match as a
//!    *candidate*.
//! 2. [`ScanEngine::next_scan`] re-reads each candidate and keeps only those
//!    that still hold the (new) value. Addresses that weren't candidates are
//!    never reconsidered.
//! 3. [`ScanEngine::scan_results`] pages through the candidates, reporting the
//!    value each holds *now*.
//!
//! Memory is failure-prone: ranges get unmapped between enumeration and
//! reading. A range that fails to scan is skipped, a candidate that fails to
//! re-read is dropped, and a result that fails to read is reported without a
//! value.
//!
//! [`ScanEngine::scan_strings`] is a separate one-shot search that neither
//! uses nor affects the scan session.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::error::{HoldfastError, HoldfastResult};
use crate::memory::{read_c_string, DEFAULT_STRING_MAX_LENGTH};
use crate::substrate::Substrate;
use crate::types::{Address, MemoryRange, Protection, Scalar, Width};

/// Regions skipped by default: shared system caches and kernel-provided pages.
pub const DEFAULT_EXCLUDED_REGIONS: [&str; 4] = ["dyld_shared_cache", "[vvar]", "[vsyscall]", "[vdso]"];

/// Tunables for scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions
{
    /// Ranges whose backing file path contains any of these are skipped
    pub excluded_regions: Vec<String>,
    /// Bytes read per candidate when filtering strings
    pub string_max_length: usize,
}

impl Default for ScanOptions
{
    fn default() -> Self
    {
        Self {
            excluded_regions: DEFAULT_EXCLUDED_REGIONS.iter().map(ToString::to_string).collect(),
            string_max_length: DEFAULT_STRING_MAX_LENGTH,
        }
    }
}

/// Candidate set of the active scan session.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScanState
{
    candidates: Vec<Address>,
    width: Width,
    signed: bool,
}

/// A candidate and the value it holds at the time of the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanResult
{
    /// Candidate address
    pub address: Address,
    /// Current value, or `None` if the address could not be read
    pub value: Option<Scalar>,
}

/// One page of scan results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPage
{
    /// Candidates on this page
    pub results: Vec<ScanResult>,
    /// Total number of candidates
    pub total: usize,
    /// Page number after clamping (1-based)
    pub page: usize,
    /// Requested page size
    pub page_size: usize,
    /// Number of pages, `ceil(total / page_size)`
    pub total_pages: usize,
}

/// Owner of the scan session.
pub struct ScanEngine
{
    substrate: Arc<dyn Substrate>,
    options: ScanOptions,
    state: Mutex<Option<ScanState>>,
}

impl fmt::Debug for ScanEngine
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_struct("ScanEngine")
            .field("options", &self.options)
            .field("candidates", &self.candidate_count())
            .finish_non_exhaustive()
    }
}

impl ScanEngine
{
    /// Create an engine with no active session.
    #[must_use]
    pub fn new(substrate: Arc<dyn Substrate>, options: ScanOptions) -> Self
    {
        Self {
            substrate,
            options,
            state: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<ScanState>>
    {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of candidates in the active session, if there is one.
    #[must_use]
    pub fn candidate_count(&self) -> Option<usize>
    {
        self.lock().as_ref().map(|state| state.candidates.len())
    }

    /// Writable ranges that aren't excluded.
    fn scannable_ranges(&self) -> HoldfastResult<Vec<MemoryRange>>
    {
        let ranges = self.substrate.enumerate_ranges(Protection::READ_WRITE)?;
        Ok(ranges
            .into_iter()
            .filter(|range| !range.matches_any(&self.options.excluded_regions))
            .collect())
    }

    fn scan_all(&self, pattern: &[u8]) -> HoldfastResult<Vec<Address>>
    {
        let mut matches = Vec::new();
        for range in self.scannable_ranges()? {
            match self.substrate.scan_range(&range, pattern) {
                Ok(found) => matches.extend(found),
                Err(err) => debug!(base = %range.base, size = range.size, error = %err, "Skipping unreadable range"),
            }
        }
        matches.sort_unstable();
        matches.dedup();
        Ok(matches)
    }

    /// Start a new session with every location holding `target`
    ///
    /// Any previous session is replaced. Returns the number of matches.
    ///
    /// ## Errors
    ///
    /// - `Substrate`: ranges could not be enumerated
    pub fn first_scan(&self, target: Scalar, width: Width, signed: bool) -> HoldfastResult<usize>
    {
        let pattern = target.encode(width);
        let candidates = self.scan_all(&pattern)?;
        let count = candidates.len();
        info!(value = %target, width = %width, signed, matches = count, "First scan complete");

        *self.lock() = Some(ScanState {
            candidates,
            width,
            signed,
        });
        Ok(count)
    }

    /// Narrow the session to candidates that currently hold `target`
    ///
    /// Returns the number of remaining candidates.
    ///
    /// ## Errors
    ///
    /// - `StateError`: no scan session exists
    pub fn next_scan(&self, target: Scalar) -> HoldfastResult<usize>
    {
        let mut guard = self.lock();
        let state = guard.as_mut().ok_or_else(no_session)?;
        let width = state.width;
        let expected = target.encode(width);
        let before = state.candidates.len();

        state.candidates.retain(|address| {
            self.substrate
                .read_memory(*address, width.bytes())
                .is_ok_and(|bytes| bytes == expected)
        });

        let count = state.candidates.len();
        info!(value = %target, before, after = count, "Next scan complete");
        Ok(count)
    }

    /// Page `page` (1-based) of the candidates with their current values
    ///
    /// `page` is clamped into `[1, total_pages]`; with no candidates the page
    /// is 1 and empty.
    ///
    /// ## Errors
    ///
    /// - `StateError`: no scan session exists
    /// - `InvalidArgument`: `page_size` is zero
    pub fn scan_results(&self, page: usize, page_size: usize) -> HoldfastResult<ScanPage>
    {
        if page_size == 0 {
            return Err(HoldfastError::InvalidArgument("page size must be positive".to_string()));
        }
        let guard = self.lock();
        let state = guard.as_ref().ok_or_else(no_session)?;

        let total = state.candidates.len();
        let total_pages = total.div_ceil(page_size);
        let page = page.clamp(1, total_pages.max(1));
        let start = ((page - 1) * page_size).min(total);
        let end = (start + page_size).min(total);

        let results = state.candidates[start..end]
            .iter()
            .map(|address| ScanResult {
                address: *address,
                value: self
                    .substrate
                    .read_memory(*address, state.width.bytes())
                    .and_then(|bytes| Scalar::decode(&bytes, state.width, state.signed))
                    .ok(),
            })
            .collect();

        Ok(ScanPage {
            results,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    /// Discard the scan session, if any.
    pub fn clear_scan_state(&self)
    {
        if self.lock().take().is_some() {
            debug!("Scan state cleared");
        }
    }

    /// One-shot text search
    ///
    /// With `addresses`, keeps those whose current string contains `target`.
    /// Otherwise searches every writable range for the UTF-8 bytes of
    /// `target` and returns the match addresses.
    ///
    /// ## Errors
    ///
    /// - `InvalidArgument`: `target` is empty
    /// - `Substrate`: ranges could not be enumerated
    pub fn scan_strings(&self, target: &str, addresses: Option<&[Address]>) -> HoldfastResult<Vec<Address>>
    {
        if target.is_empty() {
            return Err(HoldfastError::InvalidArgument("string scan target must not be empty".to_string()));
        }

        let matches = match addresses {
            Some(addresses) if !addresses.is_empty() => addresses
                .iter()
                .copied()
                .filter(|address| {
                    read_c_string(self.substrate.as_ref(), *address, self.options.string_max_length)
                        .is_ok_and(|text| text.contains(target))
                })
                .collect(),
            _ => self.scan_all(target.as_bytes())?,
        };
        info!(target, matches = matches.len(), "String scan complete");
        Ok(matches)
    }
}

fn no_session() -> HoldfastError
{
    HoldfastError::StateError("no scan session; run firstScan first".to_string())
}
