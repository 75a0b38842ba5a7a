use crate::error::GrammarError;
use crate::pattern::Pattern;
use onig::{Regex, Region, SearchOptions};
use std::cell::RefCell;
use std::rc::Rc;

/// One capture group's span within a match. Offsets are UTF-8 bytes into the
/// scanned line; groups that did not participate report an empty span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CaptureIndex {
    pub index: u32,
    pub start: usize,
    pub end: usize,
}

/// A successful scan: which pattern matched and where.
#[derive(Debug)]
pub(crate) struct ScanMatch {
    pub scanner: Rc<Scanner>,
    pub pattern_index: usize,
    pub capture_indices: Vec<CaptureIndex>,
}

/// Finds the earliest match among a set of compiled patterns.
///
/// Anchored patterns (`\A`, `\G`, `\z`) compile differently depending on
/// whether the first line is being scanned and whether the scan position sits
/// exactly on the anchor position, so up to four compiled variants are cached
/// and the right one is selected per scan.
#[derive(Debug)]
pub(crate) struct Scanner {
    patterns: Vec<Rc<Pattern>>,
    anchored: bool,
    cache: RefCell<ScannerCache>,
}

#[derive(Debug, Default)]
struct ScannerCache {
    scanner: Option<Rc<CompiledScanner>>,
    first_line_scanner: Option<Rc<CompiledScanner>>,
    anchored_scanner: Option<Rc<CompiledScanner>>,
    first_line_anchored_scanner: Option<Rc<CompiledScanner>>,
}

#[derive(Debug)]
struct CompiledScanner {
    regexes: Vec<Regex>,
}

impl Scanner {
    pub(crate) fn new(patterns: Vec<Rc<Pattern>>) -> Self {
        let anchored = patterns.iter().any(|pattern| pattern.is_anchored());
        Self {
            patterns,
            anchored,
            cache: RefCell::new(ScannerCache::default()),
        }
    }

    pub(crate) fn pattern(&self, index: usize) -> Option<&Rc<Pattern>> {
        self.patterns.get(index)
    }

    /// Find the next match on `line` starting at `position`.
    ///
    /// `anchor_position` is the end offset of the last `begin` match (or −1);
    /// it decides whether `\G` is live for this scan.
    pub(crate) fn find_next_match(
        self: &Rc<Self>,
        line: &str,
        first_line: bool,
        position: usize,
        anchor_position: isize,
    ) -> Result<Option<ScanMatch>, GrammarError> {
        if position > line.len() {
            return Ok(None);
        }
        let at_anchor = position as isize == anchor_position;
        let compiled = self.compiled(first_line, at_anchor)?;
        Ok(compiled
            .find_next_match_sync(line, position)
            .map(|(pattern_index, capture_indices)| ScanMatch {
                scanner: self.clone(),
                pattern_index,
                capture_indices,
            }))
    }

    fn compiled(
        &self,
        first_line: bool,
        at_anchor: bool,
    ) -> Result<Rc<CompiledScanner>, GrammarError> {
        let mut cache = self.cache.borrow_mut();
        let slot = if !self.anchored {
            &mut cache.scanner
        } else if first_line {
            if at_anchor {
                &mut cache.first_line_anchored_scanner
            } else {
                &mut cache.first_line_scanner
            }
        } else if at_anchor {
            &mut cache.anchored_scanner
        } else {
            &mut cache.scanner
        };

        if let Some(compiled) = slot {
            return Ok(compiled.clone());
        }
        let compiled = Rc::new(self.compile(first_line, at_anchor)?);
        *slot = Some(compiled.clone());
        Ok(compiled)
    }

    fn compile(&self, first_line: bool, at_anchor: bool) -> Result<CompiledScanner, GrammarError> {
        let mut regexes = Vec::with_capacity(self.patterns.len());
        for pattern in &self.patterns {
            let source = pattern.regex_source(first_line, at_anchor);
            let regex = Regex::new(&source).map_err(|e| GrammarError::RegexCompile {
                pattern: source.into_owned(),
                message: e.to_string(),
            })?;
            regexes.push(regex);
        }
        Ok(CompiledScanner { regexes })
    }
}

impl CompiledScanner {
    /// Scan every regex from `position` and keep the match starting earliest.
    /// Declaration order breaks ties; a match starting exactly at `position`
    /// cannot be beaten, so the loop short-circuits there.
    fn find_next_match_sync(&self, line: &str, position: usize) -> Option<(usize, Vec<CaptureIndex>)> {
        let mut best: Option<(usize, usize, Vec<CaptureIndex>)> = None;
        for (index, regex) in self.regexes.iter().enumerate() {
            let mut region = Region::new();
            let Some(start) = regex.search_with_options(
                line,
                position,
                line.len(),
                SearchOptions::SEARCH_OPTION_NONE,
                Some(&mut region),
            ) else {
                continue;
            };

            if best.as_ref().is_none_or(|(best_start, _, _)| start < *best_start) {
                best = Some((start, index, capture_indices(&region)));
            }
            if start == position {
                break;
            }
        }
        best.map(|(_, index, captures)| (index, captures))
    }
}

fn capture_indices(region: &Region) -> Vec<CaptureIndex> {
    (0..region.len())
        .map(|group| match region.pos(group) {
            Some((start, end)) => CaptureIndex {
                index: group as u32,
                start,
                end,
            },
            None => CaptureIndex {
                index: group as u32,
                start: 0,
                end: 0,
            },
        })
        .collect()
}
