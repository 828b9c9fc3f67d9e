use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::{Display, Formatter};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("search error: {0}")]
    Search(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bit 0 of every stemma mask is reserved for "source unknown" (`?`).
pub const UNCLEAR_BIT: u64 = 1;
/// Usable clique bits per location. Persisted masks depend on this width;
/// widening would break compatibility, so overflow is reported instead.
pub const MAX_CLIQUE_BITS: u32 = 62;
/// Reading codes starting with this prefix are lacuna-class pseudo-readings.
pub const LACUNA_PREFIX: char = 'z';
/// Upper bound on the exhaustive substemma candidate set (power-set search).
pub const MAX_EXHAUSTIVE_CANDIDATES: usize = 16;

const SUBSTEMMA_EQUAL_WEIGHT: f64 = 2.0;
const SUBSTEMMA_POSTERIOR_WEIGHT: f64 = 1.0;

const ORIGINAL_KEY: &str = "*";
const UNKNOWN_KEY: &str = "?";

/// Small-integer code for a reading: 0 for lacuna-class or empty, 1 for
/// `a`, 2 for `b`, and so on by first character.
#[must_use]
pub fn labez_code(labez: &str) -> u16 {
    let Some(first) = labez.chars().next() else {
        return 0;
    };
    if !first.is_ascii_lowercase() || first == LACUNA_PREFIX {
        return 0;
    }
    u16::from(first as u8 - b'a') + 1
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RangeDef {
    pub name: String,
    /// First location index in the range.
    pub start: usize,
    /// One past the last location index (half-open).
    pub end: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StemmaEdgeRecord {
    pub location: usize,
    pub labez: String,
    pub clique: String,
    pub source_labez: Option<String>,
    pub source_clique: Option<String>,
    pub is_original: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttestationRecord {
    pub manuscript: usize,
    pub location: usize,
    pub labez: String,
    pub clique: String,
    pub certainty: f64,
}

/// Frozen editorial and attestation data for one engine run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub manuscript_count: usize,
    pub location_count: usize,
    /// Index of the designated base/original manuscript.
    pub base_manuscript: usize,
    pub ranges: Vec<RangeDef>,
    pub stemma_edges: Vec<StemmaEdgeRecord>,
    pub attestations: Vec<AttestationRecord>,
}

impl Snapshot {
    /// Validate index bounds and value ranges before a run.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when a range is inverted or out of
    /// bounds, an edge or attestation references an unknown index, a
    /// certainty falls outside `(0, 1]`, or the base manuscript is invalid.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.manuscript_count == 0 || self.location_count == 0 {
            return Err(KernelError::Validation(
                "snapshot MUST declare at least one manuscript and one location".to_string(),
            ));
        }

        if self.base_manuscript >= self.manuscript_count {
            return Err(KernelError::Validation(format!(
                "base manuscript index {} is out of bounds (manuscript count {})",
                self.base_manuscript, self.manuscript_count
            )));
        }

        for range in &self.ranges {
            if range.start > range.end || range.end > self.location_count {
                return Err(KernelError::Validation(format!(
                    "range `{}` [{}, {}) is not a valid half-open interval over {} locations",
                    range.name, range.start, range.end, self.location_count
                )));
            }
        }

        for edge in &self.stemma_edges {
            if edge.location >= self.location_count {
                return Err(KernelError::Validation(format!(
                    "stemma edge for reading `{}{}` references unknown location {}",
                    edge.labez, edge.clique, edge.location
                )));
            }
        }

        for attestation in &self.attestations {
            if attestation.manuscript >= self.manuscript_count
                || attestation.location >= self.location_count
            {
                return Err(KernelError::Validation(format!(
                    "attestation references unknown cell (manuscript {}, location {})",
                    attestation.manuscript, attestation.location
                )));
            }
            if !(attestation.certainty > 0.0 && attestation.certainty <= 1.0) {
                return Err(KernelError::Validation(format!(
                    "certainty MUST be in (0.0, 1.0], got {} at (manuscript {}, location {})",
                    attestation.certainty, attestation.manuscript, attestation.location
                )));
            }
        }

        Ok(())
    }

    /// Deterministic content digest used to tag runs computed from the same
    /// frozen snapshot.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.manuscript_count.to_le_bytes());
        hasher.update(self.location_count.to_le_bytes());
        hasher.update(self.base_manuscript.to_le_bytes());
        for range in &self.ranges {
            hasher.update(range.name.as_bytes());
            hasher.update(range.start.to_le_bytes());
            hasher.update(range.end.to_le_bytes());
        }
        for edge in &self.stemma_edges {
            hasher.update(edge.location.to_le_bytes());
            hasher.update(edge.labez.as_bytes());
            hasher.update(edge.clique.as_bytes());
            hasher.update(edge.source_labez.as_deref().unwrap_or("-").as_bytes());
            hasher.update(edge.source_clique.as_deref().unwrap_or("-").as_bytes());
            hasher.update([u8::from(edge.is_original)]);
        }
        for attestation in &self.attestations {
            hasher.update(attestation.manuscript.to_le_bytes());
            hasher.update(attestation.location.to_le_bytes());
            hasher.update(attestation.labez.as_bytes());
            hasher.update(attestation.clique.as_bytes());
            hasher.update(attestation.certainty.to_bits().to_le_bytes());
        }
        let digest = hasher.finalize();
        let digest_hex = format!("{digest:x}");
        format!("snap_{}", &digest_hex[..16])
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd)]
pub struct BaseViolation {
    pub range: usize,
    pub manuscript: usize,
}

/// Accumulated per-run fault report. The engine never aborts a run for a
/// single bad location or pair; callers read this summary and decide whether
/// to keep the results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Diagnostics {
    /// Locations whose local stemma is not a DAG; ancestry excluded.
    pub cyclic_locations: Vec<usize>,
    /// Locations with two `is_original` claims; ancestry excluded.
    pub duplicate_original_locations: Vec<usize>,
    /// Locations whose stemma is not weakly connected; still used.
    pub disconnected_locations: Vec<usize>,
    /// Locations with more than 62 cliques; excess nodes degrade to mask 0.
    pub bit_overflow_locations: Vec<usize>,
    /// Attestations whose clique is absent from the stemma snapshot.
    pub stemma_lookup_misses: usize,
    /// Locations where a mutual-older contradiction was cleared.
    pub loop_locations: Vec<usize>,
    /// (range, manuscript) cells where the base manuscript appears descended.
    pub base_violations: Vec<BaseViolation>,
}

impl Diagnostics {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.cyclic_locations.is_empty()
            && self.duplicate_original_locations.is_empty()
            && self.disconnected_locations.is_empty()
            && self.bit_overflow_locations.is_empty()
            && self.stemma_lookup_misses == 0
            && self.loop_locations.is_empty()
            && self.base_violations.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StemmaNode {
    pub key: String,
    /// The node's own bit. 0 for `*`, for overflowed nodes, and for every
    /// node of an excluded location.
    pub mask: u64,
    /// OR of the masks of the node's immediate sources.
    pub parents: u64,
    /// OR of the masks of every node this one derives from, transitively.
    pub ancestors: u64,
}

/// Labeled derivation DAG over the cliques of one location, with masks
/// propagated. Bit assignments are stable only within this location.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LocalStemma {
    pub location: usize,
    nodes: Vec<StemmaNode>,
    index: BTreeMap<String, usize>,
    edges: Vec<(usize, usize)>,
    pub cyclic: bool,
    pub duplicate_original: bool,
    pub disconnected: bool,
    pub overflowed: bool,
    /// True when ancestry data is excluded (cycle or duplicate original).
    pub excluded: bool,
}

impl LocalStemma {
    #[must_use]
    pub fn node(&self, key: &str) -> Option<&StemmaNode> {
        self.index.get(key).map(|&idx| &self.nodes[idx])
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn nodes(&self) -> &[StemmaNode] {
        &self.nodes
    }

    fn ensure_node(&mut self, key: &str) -> usize {
        if let Some(&idx) = self.index.get(key) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(StemmaNode { key: key.to_string(), mask: 0, parents: 0, ancestors: 0 });
        self.index.insert(key.to_string(), idx);
        idx
    }

    fn assign_bits(&mut self) {
        // BTreeMap iteration is lexicographic, which makes bit assignment
        // independent of edge-record order.
        let mut next_bit = 1_u32;
        for (key, &idx) in &self.index {
            self.nodes[idx].mask = match key.as_str() {
                ORIGINAL_KEY => 0,
                UNKNOWN_KEY => UNCLEAR_BIT,
                _ => {
                    if next_bit <= MAX_CLIQUE_BITS {
                        let mask = 1_u64 << next_bit;
                        next_bit += 1;
                        mask
                    } else {
                        self.overflowed = true;
                        0
                    }
                }
            };
        }
    }

    fn is_weakly_connected(&self) -> bool {
        if self.nodes.len() <= 2 {
            return true;
        }

        let mut undirected: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &(source, target) in &self.edges {
            undirected[source].push(target);
            undirected[target].push(source);
        }

        // A virtual root joins the two synthetic roots, so seeding the walk
        // from both is equivalent to walking from it.
        let mut visited = vec![false; self.nodes.len()];
        let mut queue: VecDeque<usize> = VecDeque::new();
        for key in [ORIGINAL_KEY, UNKNOWN_KEY] {
            if let Some(&idx) = self.index.get(key) {
                visited[idx] = true;
                queue.push_back(idx);
            }
        }
        while let Some(current) = queue.pop_front() {
            for &next in &undirected[current] {
                if !visited[next] {
                    visited[next] = true;
                    queue.push_back(next);
                }
            }
        }

        visited.iter().all(|&seen| seen)
    }

    fn topological_order(&self) -> Option<Vec<usize>> {
        let mut indegree = vec![0_usize; self.nodes.len()];
        let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &(source, target) in &self.edges {
            indegree[target] += 1;
            outgoing[source].push(target);
        }

        let mut queue: VecDeque<usize> = (0..self.nodes.len())
            .filter(|&idx| indegree[idx] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(current) = queue.pop_front() {
            order.push(current);
            for &next in &outgoing[current] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }

        if order.len() == self.nodes.len() {
            Some(order)
        } else {
            None
        }
    }

    fn propagate(&mut self) {
        self.disconnected = !self.is_weakly_connected();

        let order = self.topological_order();
        if order.is_none() {
            self.cyclic = true;
        }
        self.excluded = self.cyclic || self.duplicate_original;
        if self.excluded {
            // Partial or cyclic ancestry must not leak downstream.
            for node in &mut self.nodes {
                node.parents = 0;
                node.ancestors = 0;
            }
            return;
        }

        let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); self.nodes.len()];
        for &(source, target) in &self.edges {
            let source_mask = self.nodes[source].mask;
            self.nodes[target].parents |= source_mask;
            incoming[target].push(source);
        }

        if let Some(order) = order {
            for target in order {
                let mut ancestors = 0_u64;
                for &source in &incoming[target] {
                    ancestors |= self.nodes[source].mask | self.nodes[source].ancestors;
                }
                self.nodes[target].ancestors = ancestors;
            }
        }
    }
}

/// Build and propagate the local stemma for one location from its edge
/// records. Lacuna-class records are ignored.
#[must_use]
pub fn build_local_stemma(location: usize, records: &[StemmaEdgeRecord]) -> LocalStemma {
    let mut stemma = LocalStemma {
        location,
        nodes: Vec::new(),
        index: BTreeMap::new(),
        edges: Vec::new(),
        cyclic: false,
        duplicate_original: false,
        disconnected: false,
        overflowed: false,
        excluded: false,
    };
    let original_root = stemma.ensure_node(ORIGINAL_KEY);
    let unknown_root = stemma.ensure_node(UNKNOWN_KEY);

    let mut edges: BTreeSet<(usize, usize)> = BTreeSet::new();
    let mut original_node: Option<usize> = None;
    for record in records {
        if record.location != location || labez_code(&record.labez) == 0 {
            continue;
        }

        let key = format!("{}{}", record.labez, record.clique);
        let target = stemma.ensure_node(&key);
        match &record.source_labez {
            Some(source_labez) => {
                let source_key = format!(
                    "{}{}",
                    source_labez,
                    record.source_clique.as_deref().unwrap_or("1")
                );
                let source = stemma.ensure_node(&source_key);
                edges.insert((source, target));
            }
            None if record.is_original => {
                if original_node.is_some_and(|prev| prev != target) {
                    stemma.duplicate_original = true;
                }
                original_node = Some(target);
                edges.insert((original_root, target));
            }
            None => {
                edges.insert((unknown_root, target));
            }
        }
    }

    stemma.edges = edges.into_iter().collect();
    stemma.assign_bits();
    stemma.propagate();
    stemma
}

/// Build every location's stemma from a snapshot. Locations are independent,
/// so this runs as a parallel map.
#[must_use]
pub fn build_local_stemmata(snapshot: &Snapshot) -> Vec<LocalStemma> {
    let mut grouped: Vec<Vec<StemmaEdgeRecord>> = vec![Vec::new(); snapshot.location_count];
    for edge in &snapshot.stemma_edges {
        if edge.location < snapshot.location_count {
            grouped[edge.location].push(edge.clone());
        }
    }

    grouped
        .par_iter()
        .enumerate()
        .map(|(location, records)| build_local_stemma(location, records))
        .collect()
}

/// Dense per-(manuscript, location) arrays derived from attestations and
/// propagated stemmata.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AttestationMatrices {
    pub manuscript_count: usize,
    pub location_count: usize,
    /// Small-integer reading code; 0 means lacuna or undefined.
    pub labez: Vec<Vec<u16>>,
    /// True iff the manuscript has a certain, non-lacuna reading at a
    /// location that is itself variant.
    pub defined: Vec<Vec<bool>>,
    pub mask: Vec<Vec<u64>>,
    pub parents: Vec<Vec<u64>>,
    pub ancestors: Vec<Vec<u64>>,
    /// Attestations whose clique was not found in the location's stemma.
    pub lookup_misses: usize,
}

impl AttestationMatrices {
    #[must_use]
    pub fn zeros(manuscript_count: usize, location_count: usize) -> Self {
        Self {
            manuscript_count,
            location_count,
            labez: vec![vec![0; location_count]; manuscript_count],
            defined: vec![vec![false; location_count]; manuscript_count],
            mask: vec![vec![0; location_count]; manuscript_count],
            parents: vec![vec![0; location_count]; manuscript_count],
            ancestors: vec![vec![0; location_count]; manuscript_count],
            lookup_misses: 0,
        }
    }
}

/// Build the dense attestation arrays and overlay the stemma masks.
/// Requires every location's stemma to be fully propagated first.
#[must_use]
pub fn build_attestation_matrices(
    snapshot: &Snapshot,
    stemmata: &[LocalStemma],
) -> AttestationMatrices {
    let mut matrices =
        AttestationMatrices::zeros(snapshot.manuscript_count, snapshot.location_count);
    let mut keys: Vec<Vec<Option<String>>> =
        vec![vec![None; snapshot.location_count]; snapshot.manuscript_count];

    for attestation in &snapshot.attestations {
        // Uncertain readings do not participate in genealogical comparison.
        if attestation.certainty < 1.0 {
            continue;
        }
        let code = labez_code(&attestation.labez);
        if code == 0 {
            continue;
        }
        let ms = attestation.manuscript;
        let loc = attestation.location;
        matrices.labez[ms][loc] = code;
        keys[ms][loc] = Some(format!("{}{}", attestation.labez, attestation.clique));
    }

    // A location carried uniformly by every attesting manuscript is not
    // variant and counts as undefined for all of them.
    let mut variant = vec![false; snapshot.location_count];
    for (loc, flag) in variant.iter_mut().enumerate() {
        let mut seen: Option<u16> = None;
        for ms in 0..snapshot.manuscript_count {
            let code = matrices.labez[ms][loc];
            if code == 0 {
                continue;
            }
            match seen {
                None => seen = Some(code),
                Some(previous) if previous != code => {
                    *flag = true;
                    break;
                }
                Some(_) => {}
            }
        }
    }

    for ms in 0..snapshot.manuscript_count {
        for loc in 0..snapshot.location_count {
            let code = matrices.labez[ms][loc];
            matrices.defined[ms][loc] = code != 0 && variant[loc];
            let Some(key) = keys[ms][loc].as_deref() else {
                continue;
            };
            match stemmata.get(loc).and_then(|stemma| stemma.node(key)) {
                Some(node) => {
                    matrices.mask[ms][loc] = node.mask;
                    matrices.parents[ms][loc] = node.parents;
                    matrices.ancestors[ms][loc] = node.ancestors;
                }
                None => {
                    // Stemma edits can lag attestation edits; the cell simply
                    // contributes nothing to ancestry.
                    matrices.lookup_misses += 1;
                }
            }
        }
    }

    matrices
}

/// Prefix-sum table over a boolean vector: `out[i]` is the count of `true`
/// values in positions `[0, i)`.
#[must_use]
pub fn prefix_counts(flags: &[bool]) -> Vec<u32> {
    let mut out = Vec::with_capacity(flags.len() + 1);
    let mut total = 0_u32;
    out.push(0);
    for &flag in flags {
        total += u32::from(flag);
        out.push(total);
    }
    out
}

/// Count of `true` values inside the half-open interval `[start, end)`.
#[must_use]
pub fn range_count(prefix: &[u32], start: usize, end: usize) -> u32 {
    prefix[end] - prefix[start]
}

/// Per-range pairwise matrices. `and_count`/`eq_count` are symmetric;
/// `*_older[r][j][k]` counts locations where j's reading is ancestral to
/// k's, so `[j][k]` and `[k][j]` differ.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CoherenceMatrices {
    pub range_count: usize,
    pub manuscript_count: usize,
    pub and_count: Vec<Vec<Vec<u32>>>,
    pub eq_count: Vec<Vec<Vec<u32>>>,
    pub ancestor_older: Vec<Vec<Vec<u32>>>,
    pub ancestor_unclear: Vec<Vec<Vec<u32>>>,
    pub parent_older: Vec<Vec<Vec<u32>>>,
    pub parent_unclear: Vec<Vec<Vec<u32>>>,
    /// Defined-location count per range per manuscript.
    pub lengths: Vec<Vec<u32>>,
    pub loop_locations: Vec<usize>,
    pub base_violations: Vec<BaseViolation>,
}

struct PairCounts {
    k: usize,
    and_count: Vec<u32>,
    eq_count: Vec<u32>,
    anc_older_jk: Vec<u32>,
    anc_older_kj: Vec<u32>,
    anc_unclear: Vec<u32>,
    par_older_jk: Vec<u32>,
    par_older_kj: Vec<u32>,
    par_unclear: Vec<u32>,
}

struct RowResult {
    j: usize,
    pairs: Vec<PairCounts>,
    loops: BTreeSet<usize>,
}

fn count_ranges(flags: &[bool], ranges: &[RangeDef]) -> Vec<u32> {
    let prefix = prefix_counts(flags);
    ranges.iter().map(|range| range_count(&prefix, range.start, range.end)).collect()
}

fn compute_pair(
    matrices: &AttestationMatrices,
    ranges: &[RangeDef],
    j: usize,
    k: usize,
) -> (PairCounts, BTreeSet<usize>) {
    let locations = matrices.location_count;
    let mut both = vec![false; locations];
    let mut equal = vec![false; locations];
    let mut anc_jk = vec![false; locations];
    let mut anc_kj = vec![false; locations];
    let mut anc_un = vec![false; locations];
    let mut par_jk = vec![false; locations];
    let mut par_kj = vec![false; locations];
    let mut par_un = vec![false; locations];
    let mut loops = BTreeSet::new();

    for loc in 0..locations {
        if !(matrices.defined[j][loc] && matrices.defined[k][loc]) {
            continue;
        }
        both[loc] = true;
        let readings_equal = matrices.labez[j][loc] == matrices.labez[k][loc];
        equal[loc] = readings_equal;

        let mask_j = matrices.mask[j][loc];
        let mask_k = matrices.mask[k][loc];

        let mut j_older = mask_j & matrices.ancestors[k][loc] != 0;
        let mut k_older = mask_k & matrices.ancestors[j][loc] != 0;
        if j_older && k_older {
            // Impossible in a true DAG; a contradictory double edit. Clear
            // both directions and report the location once.
            j_older = false;
            k_older = false;
            loops.insert(loc);
        }
        anc_jk[loc] = j_older;
        anc_kj[loc] = k_older;
        let unclear_bit =
            (matrices.ancestors[j][loc] | matrices.ancestors[k][loc]) & UNCLEAR_BIT != 0;
        anc_un[loc] = !readings_equal && !j_older && !k_older && unclear_bit;

        let mut j_parent = mask_j & matrices.parents[k][loc] != 0;
        let mut k_parent = mask_k & matrices.parents[j][loc] != 0;
        if j_parent && k_parent {
            j_parent = false;
            k_parent = false;
        }
        par_jk[loc] = j_parent;
        par_kj[loc] = k_parent;
        let parent_unclear_bit =
            (matrices.parents[j][loc] | matrices.parents[k][loc]) & UNCLEAR_BIT != 0;
        par_un[loc] = !readings_equal && !j_parent && !k_parent && parent_unclear_bit;
    }

    let counts = PairCounts {
        k,
        and_count: count_ranges(&both, ranges),
        eq_count: count_ranges(&equal, ranges),
        anc_older_jk: count_ranges(&anc_jk, ranges),
        anc_older_kj: count_ranges(&anc_kj, ranges),
        anc_unclear: count_ranges(&anc_un, ranges),
        par_older_jk: count_ranges(&par_jk, ranges),
        par_older_kj: count_ranges(&par_kj, ranges),
        par_unclear: count_ranges(&par_un, ranges),
    };
    (counts, loops)
}

/// Compute the symmetric pre-genealogical and asymmetric post-genealogical
/// matrices for every manuscript pair, per range. Rows are independent, so
/// the pass runs as a parallel map over manuscript rows.
#[must_use]
pub fn compute_coherence(snapshot: &Snapshot, matrices: &AttestationMatrices) -> CoherenceMatrices {
    let manuscripts = matrices.manuscript_count;
    let ranges = &snapshot.ranges;
    let range_total = ranges.len();

    let rows: Vec<RowResult> = (0..manuscripts)
        .into_par_iter()
        .map(|j| {
            let mut pairs = Vec::with_capacity(manuscripts.saturating_sub(j + 1));
            let mut loops = BTreeSet::new();
            for k in (j + 1)..manuscripts {
                let (counts, pair_loops) = compute_pair(matrices, ranges, j, k);
                loops.extend(pair_loops);
                pairs.push(counts);
            }
            RowResult { j, pairs, loops }
        })
        .collect();

    let zero = vec![vec![vec![0_u32; manuscripts]; manuscripts]; range_total];
    let mut result = CoherenceMatrices {
        range_count: range_total,
        manuscript_count: manuscripts,
        and_count: zero.clone(),
        eq_count: zero.clone(),
        ancestor_older: zero.clone(),
        ancestor_unclear: zero.clone(),
        parent_older: zero.clone(),
        parent_unclear: zero,
        lengths: Vec::new(),
        loop_locations: Vec::new(),
        base_violations: Vec::new(),
    };

    let mut all_loops = BTreeSet::new();
    for row in rows {
        all_loops.extend(row.loops);
        let j = row.j;
        for pair in row.pairs {
            let k = pair.k;
            for r in 0..range_total {
                result.and_count[r][j][k] = pair.and_count[r];
                result.and_count[r][k][j] = pair.and_count[r];
                result.eq_count[r][j][k] = pair.eq_count[r];
                result.eq_count[r][k][j] = pair.eq_count[r];
                result.ancestor_older[r][j][k] = pair.anc_older_jk[r];
                result.ancestor_older[r][k][j] = pair.anc_older_kj[r];
                result.ancestor_unclear[r][j][k] = pair.anc_unclear[r];
                result.ancestor_unclear[r][k][j] = pair.anc_unclear[r];
                result.parent_older[r][j][k] = pair.par_older_jk[r];
                result.parent_older[r][k][j] = pair.par_older_kj[r];
                result.parent_unclear[r][j][k] = pair.par_unclear[r];
                result.parent_unclear[r][k][j] = pair.par_unclear[r];
            }
        }
    }
    result.loop_locations = all_loops.into_iter().collect();

    result.lengths = (0..manuscripts)
        .map(|ms| count_ranges(&matrices.defined[ms], ranges))
        .collect();

    // Nothing may be established as older than the designated original;
    // violations are reported, never corrected.
    let base = snapshot.base_manuscript;
    for r in 0..range_total {
        for j in 0..manuscripts {
            if j != base && result.ancestor_older[r][j][base] > 0 {
                result.base_violations.push(BaseViolation { range: r, manuscript: j });
            }
        }
    }

    result
}

/// One ratio-valued pairwise record for the external affinity sink.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffinityRecord {
    pub range: usize,
    pub ms1: usize,
    pub ms2: usize,
    pub common: u32,
    pub equal: u32,
    pub affinity: f64,
    pub older: u32,
    pub newer: u32,
    pub unclear: u32,
    pub p_older: u32,
    pub p_newer: u32,
    pub p_unclear: u32,
}

/// Flatten the coherence matrices into affinity records, one per ordered
/// (range, ms1, ms2) with `common > 0`. Pure transform for the external sink.
#[must_use]
pub fn materialize_affinity(matrices: &CoherenceMatrices) -> Vec<AffinityRecord> {
    let mut records = Vec::new();
    for r in 0..matrices.range_count {
        for ms1 in 0..matrices.manuscript_count {
            for ms2 in 0..matrices.manuscript_count {
                if ms1 == ms2 {
                    continue;
                }
                let common = matrices.and_count[r][ms1][ms2];
                if common == 0 {
                    continue;
                }
                let equal = matrices.eq_count[r][ms1][ms2];
                records.push(AffinityRecord {
                    range: r,
                    ms1,
                    ms2,
                    common,
                    equal,
                    affinity: f64::from(equal) / f64::from(common),
                    older: matrices.ancestor_older[r][ms1][ms2],
                    newer: matrices.ancestor_older[r][ms2][ms1],
                    unclear: matrices.ancestor_unclear[r][ms1][ms2],
                    p_older: matrices.parent_older[r][ms1][ms2],
                    p_newer: matrices.parent_older[r][ms2][ms1],
                    p_unclear: matrices.parent_unclear[r][ms1][ms2],
                });
            }
        }
    }
    records
}

#[derive(Clone, Debug, Eq, PartialEq)]
struct BitVec {
    blocks: Vec<u64>,
}

impl BitVec {
    fn zeros(len: usize) -> Self {
        Self { blocks: vec![0; len.div_ceil(64)] }
    }

    fn set(&mut self, index: usize) {
        self.blocks[index / 64] |= 1_u64 << (index % 64);
    }

    fn or_assign(&mut self, other: &Self) {
        for (block, &other_block) in self.blocks.iter_mut().zip(&other.blocks) {
            *block |= other_block;
        }
    }

    fn count(&self) -> u32 {
        self.blocks.iter().map(|block| block.count_ones()).sum()
    }

    /// Count of bits set in `self` but not in `other`.
    fn count_minus(&self, other: &Self) -> u32 {
        self.blocks
            .iter()
            .zip(&other.blocks)
            .map(|(&block, &other_block)| (block & !other_block).count_ones())
            .sum()
    }

    fn count_union(&self, other: &Self) -> u32 {
        self.blocks
            .iter()
            .zip(&other.blocks)
            .map(|(&block, &other_block)| (block | other_block).count_ones())
            .sum()
    }
}

/// One candidate set considered by the substemma search, with its
/// explanation accounting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubstemmaEntry {
    pub candidates: Vec<usize>,
    pub size: usize,
    /// Locations explained by an equal reading in the set.
    pub equal: u32,
    /// Locations explained only by derivation from a reading in the set.
    pub posterior: u32,
    /// Target locations whose reading has an unknown source; never
    /// explained by any candidate.
    pub unknown: u32,
    /// Eligible locations the set leaves unexplained.
    pub open: u32,
    pub score: f64,
    /// Best-scoring entry of its size.
    pub hint: bool,
}

struct ExplainProfile {
    /// Location ids where the target is defined and its derivation tracked.
    eligible: Vec<usize>,
    unknown_count: u32,
}

fn explain_profile(matrices: &AttestationMatrices, target: usize) -> ExplainProfile {
    let mut eligible = Vec::new();
    let mut unknown = 0_u32;
    for loc in 0..matrices.location_count {
        if !matrices.defined[target][loc] {
            continue;
        }
        if matrices.parents[target][loc] & UNCLEAR_BIT != 0 {
            unknown += 1;
        } else {
            eligible.push(loc);
        }
    }
    ExplainProfile { eligible, unknown_count: unknown }
}

fn candidate_vectors(
    matrices: &AttestationMatrices,
    target: usize,
    candidate: usize,
    eligible: &[usize],
) -> (BitVec, BitVec) {
    let mut equal = BitVec::zeros(eligible.len());
    let mut posterior = BitVec::zeros(eligible.len());
    for (slot, &loc) in eligible.iter().enumerate() {
        if !matrices.defined[candidate][loc] {
            continue;
        }
        if matrices.labez[candidate][loc] == matrices.labez[target][loc] {
            equal.set(slot);
        }
        if matrices.mask[candidate][loc] & matrices.ancestors[target][loc] != 0 {
            posterior.set(slot);
        }
    }
    (equal, posterior)
}

fn validate_substemma_args(
    matrices: &AttestationMatrices,
    target: usize,
    candidates: &[usize],
) -> Result<(), KernelError> {
    if target >= matrices.manuscript_count {
        return Err(KernelError::Validation(format!(
            "target manuscript {target} is out of bounds"
        )));
    }
    let mut seen = BTreeSet::new();
    for &candidate in candidates {
        if candidate >= matrices.manuscript_count {
            return Err(KernelError::Validation(format!(
                "candidate manuscript {candidate} is out of bounds"
            )));
        }
        if candidate == target {
            return Err(KernelError::Validation(
                "a manuscript cannot be its own substemma candidate".to_string(),
            ));
        }
        if !seen.insert(candidate) {
            return Err(KernelError::Validation(format!(
                "candidate manuscript {candidate} is listed twice"
            )));
        }
    }
    Ok(())
}

/// Greedy substemma search: repeatedly add the candidate that explains, by
/// an equal reading, the most still-unexplained locations of the target.
/// Each accepted step is returned as the recommended set of its size.
///
/// # Errors
/// Returns [`KernelError::Validation`] for out-of-bounds or duplicate
/// candidates, a self-candidate, or a zero `max_size`. An empty pool yields
/// an empty result.
pub fn substemma_greedy(
    matrices: &AttestationMatrices,
    target: usize,
    pool: &[usize],
    max_size: usize,
) -> Result<Vec<SubstemmaEntry>, KernelError> {
    validate_substemma_args(matrices, target, pool)?;
    if max_size == 0 {
        return Err(KernelError::Validation(
            "max_size MUST be at least 1 for the greedy search".to_string(),
        ));
    }

    let profile = explain_profile(matrices, target);
    let eligible_total = u32::try_from(profile.eligible.len()).unwrap_or(u32::MAX);
    let vectors: Vec<(BitVec, BitVec)> = pool
        .iter()
        .map(|&candidate| candidate_vectors(matrices, target, candidate, &profile.eligible))
        .collect();

    let mut entries = Vec::new();
    let mut used = vec![false; pool.len()];
    let mut chosen: Vec<usize> = Vec::new();
    let mut explained_equal = BitVec::zeros(profile.eligible.len());
    let mut explained_posterior = BitVec::zeros(profile.eligible.len());

    while chosen.len() < max_size {
        let mut best: Option<(usize, u32)> = None;
        for (position, (equal, _)) in vectors.iter().enumerate() {
            if used[position] {
                continue;
            }
            let gain = equal.count_minus(&explained_equal);
            // Strict comparison keeps the tie-break on the lowest pool
            // position deterministic.
            if gain > 0 && best.map_or(true, |(_, best_gain)| gain > best_gain) {
                best = Some((position, gain));
            }
        }
        let Some((position, _)) = best else {
            break;
        };

        used[position] = true;
        chosen.push(pool[position]);
        explained_equal.or_assign(&vectors[position].0);
        explained_posterior.or_assign(&vectors[position].1);

        let equal = explained_equal.count();
        let posterior = explained_posterior.count_minus(&explained_equal);
        let open = eligible_total - explained_equal.count_union(&explained_posterior);
        entries.push(SubstemmaEntry {
            candidates: chosen.clone(),
            size: chosen.len(),
            equal,
            posterior,
            unknown: profile.unknown_count,
            open,
            score: substemma_score(equal, posterior),
            hint: true,
        });
    }

    Ok(entries)
}

fn substemma_score(equal: u32, posterior: u32) -> f64 {
    SUBSTEMMA_EQUAL_WEIGHT * f64::from(equal) + SUBSTEMMA_POSTERIOR_WEIGHT * f64::from(posterior)
}

fn enumerate_subsets(
    vectors: &[(BitVec, BitVec)],
    candidates: &[usize],
    position: usize,
    chosen: &mut Vec<usize>,
    union: &(BitVec, BitVec),
    record: &mut dyn FnMut(&[usize], &BitVec, &BitVec),
) {
    if position == vectors.len() {
        if !chosen.is_empty() {
            record(chosen, &union.0, &union.1);
        }
        return;
    }

    enumerate_subsets(vectors, candidates, position + 1, chosen, union, record);

    let mut with_equal = union.0.clone();
    let mut with_posterior = union.1.clone();
    with_equal.or_assign(&vectors[position].0);
    with_posterior.or_assign(&vectors[position].1);
    chosen.push(candidates[position]);
    enumerate_subsets(
        vectors,
        candidates,
        position + 1,
        chosen,
        &(with_equal, with_posterior),
        record,
    );
    chosen.pop();
}

/// Exhaustive substemma search over every non-empty subset of a small,
/// user-selected candidate set. A subset's coverage is the OR of its
/// members' vectors; subsets are ranked by weighted score with equality
/// counting above posteriority, and the best subset of each size is flagged
/// as a hint.
///
/// # Errors
/// Returns [`KernelError::Validation`] for invalid candidates and
/// [`KernelError::Search`] when the candidate set exceeds
/// [`MAX_EXHAUSTIVE_CANDIDATES`].
pub fn substemma_exhaustive(
    matrices: &AttestationMatrices,
    target: usize,
    candidates: &[usize],
) -> Result<Vec<SubstemmaEntry>, KernelError> {
    validate_substemma_args(matrices, target, candidates)?;
    if candidates.len() > MAX_EXHAUSTIVE_CANDIDATES {
        return Err(KernelError::Search(format!(
            "exhaustive search is limited to {} candidates (got {})",
            MAX_EXHAUSTIVE_CANDIDATES,
            candidates.len()
        )));
    }
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    let profile = explain_profile(matrices, target);
    let eligible_total = u32::try_from(profile.eligible.len()).unwrap_or(u32::MAX);
    let vectors: Vec<(BitVec, BitVec)> = candidates
        .iter()
        .map(|&candidate| candidate_vectors(matrices, target, candidate, &profile.eligible))
        .collect();

    let mut entries: Vec<SubstemmaEntry> = Vec::new();
    {
        let mut record = |chosen: &[usize], equal_union: &BitVec, posterior_union: &BitVec| {
            let equal = equal_union.count();
            let posterior = posterior_union.count_minus(equal_union);
            let open = eligible_total - equal_union.count_union(posterior_union);
            entries.push(SubstemmaEntry {
                candidates: chosen.to_vec(),
                size: chosen.len(),
                equal,
                posterior,
                unknown: profile.unknown_count,
                open,
                score: substemma_score(equal, posterior),
                hint: false,
            });
        };
        let empty = (BitVec::zeros(profile.eligible.len()), BitVec::zeros(profile.eligible.len()));
        let mut chosen = Vec::new();
        enumerate_subsets(&vectors, candidates, 0, &mut chosen, &empty, &mut record);
    }

    entries.sort_by(|lhs, rhs| {
        rhs.score
            .partial_cmp(&lhs.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| lhs.size.cmp(&rhs.size))
            .then_with(|| lhs.candidates.cmp(&rhs.candidates))
    });

    let mut hinted_sizes = BTreeSet::new();
    for entry in &mut entries {
        if hinted_sizes.insert(entry.size) {
            entry.hint = true;
        }
    }

    Ok(entries)
}

/// Full result of one batch coherence computation over a frozen snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoherenceRun {
    pub run_id: RunId,
    pub snapshot_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
    pub stemmata: Vec<LocalStemma>,
    pub attestation: AttestationMatrices,
    pub matrices: CoherenceMatrices,
    pub diagnostics: Diagnostics,
}

/// Run the whole engine: stemma construction and propagation, attestation
/// overlay, and the pairwise coherence passes. Faults degrade per location
/// or per pair and are accumulated in the diagnostics; the run itself only
/// fails on a malformed snapshot.
///
/// # Errors
/// Returns [`KernelError::Validation`] when the snapshot is malformed.
pub fn run_coherence(
    snapshot: &Snapshot,
    computed_at: OffsetDateTime,
) -> Result<CoherenceRun, KernelError> {
    snapshot.validate()?;

    let stemmata = build_local_stemmata(snapshot);
    // Hard barrier: the mask overlay must only see fully propagated stemmata.
    let attestation = build_attestation_matrices(snapshot, &stemmata);
    let matrices = compute_coherence(snapshot, &attestation);

    let mut diagnostics = Diagnostics::default();
    for stemma in &stemmata {
        if stemma.cyclic {
            diagnostics.cyclic_locations.push(stemma.location);
        }
        if stemma.duplicate_original {
            diagnostics.duplicate_original_locations.push(stemma.location);
        }
        if stemma.disconnected {
            diagnostics.disconnected_locations.push(stemma.location);
        }
        if stemma.overflowed {
            diagnostics.bit_overflow_locations.push(stemma.location);
        }
    }
    diagnostics.stemma_lookup_misses = attestation.lookup_misses;
    diagnostics.loop_locations = matrices.loop_locations.clone();
    diagnostics.base_violations = matrices.base_violations.clone();

    Ok(CoherenceRun {
        run_id: RunId::new(),
        snapshot_digest: snapshot.digest(),
        computed_at,
        stemmata,
        attestation,
        matrices,
        diagnostics,
    })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use time::Duration;

    fn fixture_time() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::seconds(1_700_000_000)
    }

    fn edge(
        location: usize,
        labez: &str,
        clique: &str,
        source: Option<(&str, &str)>,
        is_original: bool,
    ) -> StemmaEdgeRecord {
        StemmaEdgeRecord {
            location,
            labez: labez.to_string(),
            clique: clique.to_string(),
            source_labez: source.map(|(source_labez, _)| source_labez.to_string()),
            source_clique: source.map(|(_, source_clique)| source_clique.to_string()),
            is_original,
        }
    }

    fn attest(
        manuscript: usize,
        location: usize,
        labez: &str,
        clique: &str,
        certainty: f64,
    ) -> AttestationRecord {
        AttestationRecord {
            manuscript,
            location,
            labez: labez.to_string(),
            clique: clique.to_string(),
            certainty,
        }
    }

    fn whole_range(location_count: usize) -> Vec<RangeDef> {
        vec![RangeDef { name: "All".to_string(), start: 0, end: location_count }]
    }

    fn run_or_panic(snapshot: &Snapshot) -> CoherenceRun {
        match run_coherence(snapshot, fixture_time()) {
            Ok(run) => run,
            Err(err) => panic!("coherence run should succeed: {err}"),
        }
    }

    /// One location carrying `a` (original) and `b` derived from it;
    /// manuscript 0 attests `a`, manuscript 1 attests `b`.
    fn two_manuscript_snapshot() -> Snapshot {
        Snapshot {
            manuscript_count: 2,
            location_count: 1,
            base_manuscript: 0,
            ranges: whole_range(1),
            stemma_edges: vec![
                edge(0, "a", "1", None, true),
                edge(0, "b", "1", Some(("a", "1")), false),
            ],
            attestations: vec![attest(0, 0, "a", "1", 1.0), attest(1, 0, "b", "1", 1.0)],
        }
    }

    #[test]
    fn labez_code_maps_readings_and_lacunae() {
        assert_eq!(labez_code("a"), 1);
        assert_eq!(labez_code("b"), 2);
        assert_eq!(labez_code("zz"), 0);
        assert_eq!(labez_code("zu"), 0);
        assert_eq!(labez_code(""), 0);
    }

    #[test]
    fn bit_assignment_is_deterministic_across_rebuilds() {
        let records = vec![
            edge(0, "c", "1", Some(("a", "1")), false),
            edge(0, "a", "1", None, true),
            edge(0, "b", "1", Some(("a", "1")), false),
            edge(0, "b", "2", None, false),
        ];
        let mut shuffled = records.clone();
        shuffled.reverse();

        let first = build_local_stemma(0, &records);
        let second = build_local_stemma(0, &shuffled);

        for node in first.nodes() {
            let twin = match second.node(&node.key) {
                Some(twin) => twin,
                None => panic!("node {} missing after rebuild", node.key),
            };
            assert_eq!(node.mask, twin.mask, "mask differs for {}", node.key);
            assert_eq!(node.ancestors, twin.ancestors, "ancestors differ for {}", node.key);
        }
    }

    #[test]
    fn transitive_closure_follows_a_chain() {
        // * -> a -> b -> c
        let records = vec![
            edge(0, "a", "1", None, true),
            edge(0, "b", "1", Some(("a", "1")), false),
            edge(0, "c", "1", Some(("b", "1")), false),
        ];
        let stemma = build_local_stemma(0, &records);

        let a = match stemma.node("a1") {
            Some(node) => node,
            None => panic!("node a1 should exist"),
        };
        let b = match stemma.node("b1") {
            Some(node) => node,
            None => panic!("node b1 should exist"),
        };
        let c = match stemma.node("c1") {
            Some(node) => node,
            None => panic!("node c1 should exist"),
        };

        assert_eq!(c.parents, b.mask, "c's only immediate parent is b");
        assert_eq!(c.ancestors, a.mask | b.mask);
        assert_eq!(c.ancestors & UNCLEAR_BIT, 0, "rooted chain has no unknown ancestor");
        assert_eq!(a.parents, 0, "the original derives from `*`, which carries no bit");
    }

    #[test]
    fn unrooted_reading_carries_the_unclear_bit() {
        let records = vec![
            edge(0, "a", "1", None, true),
            edge(0, "b", "1", None, false),
            edge(0, "c", "1", Some(("b", "1")), false),
        ];
        let stemma = build_local_stemma(0, &records);

        let b = match stemma.node("b1") {
            Some(node) => node,
            None => panic!("node b1 should exist"),
        };
        let c = match stemma.node("c1") {
            Some(node) => node,
            None => panic!("node c1 should exist"),
        };
        assert_eq!(b.parents, UNCLEAR_BIT);
        assert_ne!(c.ancestors & UNCLEAR_BIT, 0, "unclear provenance propagates");
    }

    #[test]
    fn cycle_is_flagged_and_ancestry_excluded() {
        let records = vec![
            edge(0, "a", "1", None, true),
            edge(0, "b", "1", Some(("c", "1")), false),
            edge(0, "c", "1", Some(("b", "1")), false),
        ];
        let stemma = build_local_stemma(0, &records);

        assert!(stemma.cyclic);
        assert!(stemma.excluded);
        for node in stemma.nodes() {
            assert_eq!(node.parents, 0);
            assert_eq!(node.ancestors, 0);
        }
    }

    #[test]
    fn duplicate_original_is_flagged_not_resolved() {
        let records = vec![edge(0, "a", "1", None, true), edge(0, "b", "1", None, true)];
        let stemma = build_local_stemma(0, &records);

        assert!(stemma.duplicate_original);
        assert!(stemma.excluded);
    }

    #[test]
    fn disconnected_component_is_degraded_not_excluded() {
        // d has no source record of its own, so {c, d} floats free of the
        // roots.
        let records = vec![
            edge(0, "a", "1", None, true),
            edge(0, "b", "1", Some(("a", "1")), false),
            edge(0, "c", "1", Some(("d", "1")), false),
        ];
        let stemma = build_local_stemma(0, &records);

        assert!(stemma.disconnected);
        assert!(!stemma.excluded);
        let c = match stemma.node("c1") {
            Some(node) => node,
            None => panic!("node c1 should exist"),
        };
        assert_ne!(c.ancestors, 0, "the floating chain still propagates internally");
    }

    #[test]
    fn bit_overflow_degrades_excess_nodes_to_zero() {
        let mut records = vec![edge(0, "a", "1", None, true)];
        for clique in 2..=70 {
            records.push(edge(0, "a", &clique.to_string(), Some(("a", "1")), false));
        }
        let stemma = build_local_stemma(0, &records);

        assert!(stemma.overflowed);
        assert!(!stemma.excluded);
        let zero_masked = stemma
            .nodes()
            .iter()
            .filter(|node| node.key != ORIGINAL_KEY && node.mask == 0)
            .count();
        assert!(zero_masked > 0, "nodes beyond 62 bits must degrade to mask 0");
    }

    // Vector [1,0,1,1,0] over [1,4) counts exactly 2.
    #[test]
    fn range_counting_matches_the_interval_convention() {
        let flags = [true, false, true, true, false];
        let prefix = prefix_counts(&flags);
        assert_eq!(range_count(&prefix, 1, 4), 2);
        assert_eq!(range_count(&prefix, 0, 5), 3);
        assert_eq!(range_count(&prefix, 2, 2), 0);
    }

    #[test]
    fn two_manuscript_scenario_produces_expected_matrices() {
        let snapshot = two_manuscript_snapshot();
        let run = run_or_panic(&snapshot);

        assert_eq!(run.matrices.and_count[0][0][1], 1);
        assert_eq!(run.matrices.eq_count[0][0][1], 0);
        assert_eq!(run.matrices.ancestor_older[0][0][1], 1, "X's reading is ancestral to Y's");
        assert_eq!(run.matrices.ancestor_older[0][1][0], 0);
        assert_eq!(run.matrices.parent_older[0][0][1], 1);
        assert!(run.diagnostics.is_clean());
    }

    #[test]
    fn uniform_location_is_undefined_for_everyone() {
        let snapshot = Snapshot {
            manuscript_count: 2,
            location_count: 1,
            base_manuscript: 0,
            ranges: whole_range(1),
            stemma_edges: vec![edge(0, "a", "1", None, true)],
            attestations: vec![attest(0, 0, "a", "1", 1.0), attest(1, 0, "a", "1", 1.0)],
        };
        let run = run_or_panic(&snapshot);

        assert!(!run.attestation.defined[0][0]);
        assert_eq!(run.matrices.and_count[0][0][1], 0);
    }

    #[test]
    fn uncertain_attestation_is_forced_undefined() {
        let mut snapshot = two_manuscript_snapshot();
        snapshot.attestations[1].certainty = 0.5;
        let run = run_or_panic(&snapshot);

        assert!(!run.attestation.defined[1][0]);
        assert_eq!(run.matrices.and_count[0][0][1], 0);
    }

    #[test]
    fn stemma_lookup_miss_is_counted_in_aggregate() {
        let mut snapshot = two_manuscript_snapshot();
        // Attestation edits can lead stemma edits; clique b2 never entered
        // the stemma.
        snapshot.attestations[1].clique = "2".to_string();
        let run = run_or_panic(&snapshot);

        assert_eq!(run.diagnostics.stemma_lookup_misses, 1);
        assert_eq!(run.attestation.mask[1][0], 0);
        assert_eq!(run.matrices.ancestor_older[0][0][1], 0);
    }

    #[test]
    fn cyclic_location_contributes_definitions_but_no_ancestry() {
        let snapshot = Snapshot {
            manuscript_count: 2,
            location_count: 1,
            base_manuscript: 0,
            ranges: whole_range(1),
            stemma_edges: vec![
                edge(0, "a", "1", None, true),
                edge(0, "b", "1", Some(("c", "1")), false),
                edge(0, "c", "1", Some(("b", "1")), false),
            ],
            attestations: vec![attest(0, 0, "a", "1", 1.0), attest(1, 0, "b", "1", 1.0)],
        };
        let run = run_or_panic(&snapshot);

        assert_eq!(run.diagnostics.cyclic_locations, vec![0]);
        assert_eq!(run.matrices.and_count[0][0][1], 1, "pre-genealogical counts survive");
        assert_eq!(run.matrices.ancestor_older[0][0][1], 0, "ancestry is excluded");
    }

    #[test]
    fn injected_loop_is_cleared_in_both_directions_and_reported_once() {
        // Contradictory double edits cannot come out of the builder (cycles
        // are excluded there), so inject the poisoned masks directly.
        let snapshot = Snapshot {
            manuscript_count: 2,
            location_count: 2,
            base_manuscript: 0,
            ranges: whole_range(2),
            stemma_edges: Vec::new(),
            attestations: Vec::new(),
        };
        let mut matrices = AttestationMatrices::zeros(2, 2);
        for ms in 0..2 {
            for loc in 0..2 {
                matrices.defined[ms][loc] = true;
            }
        }
        matrices.labez[0] = vec![1, 1];
        matrices.labez[1] = vec![2, 1];
        // Location 0: each manuscript's reading claims the other as ancestor.
        matrices.mask[0][0] = 0b010;
        matrices.mask[1][0] = 0b100;
        matrices.ancestors[0][0] = 0b100;
        matrices.ancestors[1][0] = 0b010;

        let result = compute_coherence(&snapshot, &matrices);
        assert_eq!(result.ancestor_older[0][0][1], 0);
        assert_eq!(result.ancestor_older[0][1][0], 0);
        assert_eq!(result.loop_locations, vec![0]);
    }

    #[test]
    fn after_loop_clearing_older_is_one_directional_per_location() {
        let snapshot = two_manuscript_snapshot();
        let run = run_or_panic(&snapshot);
        // Single-location range: a positive count in one direction forces
        // zero in the other.
        let forward = run.matrices.ancestor_older[0][0][1];
        let backward = run.matrices.ancestor_older[0][1][0];
        assert!(forward == 0 || backward == 0);
    }

    #[test]
    fn unclear_relation_requires_the_unclear_bit() {
        // b and c both descend from the unknown root; neither is older.
        let snapshot = Snapshot {
            manuscript_count: 2,
            location_count: 1,
            base_manuscript: 0,
            ranges: whole_range(1),
            stemma_edges: vec![
                edge(0, "a", "1", None, true),
                edge(0, "b", "1", None, false),
                edge(0, "c", "1", None, false),
            ],
            attestations: vec![attest(0, 0, "b", "1", 1.0), attest(1, 0, "c", "1", 1.0)],
        };
        let run = run_or_panic(&snapshot);

        assert_eq!(run.matrices.ancestor_older[0][0][1], 0);
        assert_eq!(run.matrices.ancestor_older[0][1][0], 0);
        assert_eq!(run.matrices.ancestor_unclear[0][0][1], 1);
        assert_eq!(run.matrices.ancestor_unclear[0][1][0], 1);
    }

    #[test]
    fn base_violation_is_reported_not_corrected() {
        // Manuscript 1 is the base but attests the derived reading.
        let mut snapshot = two_manuscript_snapshot();
        snapshot.base_manuscript = 1;
        let run = run_or_panic(&snapshot);

        assert_eq!(
            run.diagnostics.base_violations,
            vec![BaseViolation { range: 0, manuscript: 0 }]
        );
        assert_eq!(run.matrices.ancestor_older[0][0][1], 1, "data is still emitted");
    }

    #[test]
    fn affinity_records_hold_the_ratio_bound() {
        let snapshot = two_manuscript_snapshot();
        let run = run_or_panic(&snapshot);
        let records = materialize_affinity(&run.matrices);

        assert!(!records.is_empty());
        for record in &records {
            assert!(record.common > 0);
            assert!(record.common >= record.equal);
            assert!((0.0..=1.0).contains(&record.affinity));
        }
    }

    #[test]
    fn affinity_swaps_asymmetric_fields_between_orders() {
        let snapshot = two_manuscript_snapshot();
        let run = run_or_panic(&snapshot);
        let records = materialize_affinity(&run.matrices);

        let forward = match records.iter().find(|r| r.ms1 == 0 && r.ms2 == 1) {
            Some(record) => record,
            None => panic!("record (0, 1) should exist"),
        };
        let backward = match records.iter().find(|r| r.ms1 == 1 && r.ms2 == 0) {
            Some(record) => record,
            None => panic!("record (1, 0) should exist"),
        };
        assert_eq!(forward.common, backward.common);
        assert_eq!(forward.equal, backward.equal);
        assert_eq!(forward.older, backward.newer);
        assert_eq!(forward.newer, backward.older);
    }

    #[test]
    fn snapshot_validation_rejects_bad_input() {
        let mut snapshot = two_manuscript_snapshot();
        snapshot.ranges[0].end = 9;
        let err = match run_coherence(&snapshot, fixture_time()) {
            Ok(_) => panic!("inverted or oversized range must be rejected"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("half-open"));

        let mut snapshot = two_manuscript_snapshot();
        snapshot.attestations[0].certainty = 1.5;
        assert!(run_coherence(&snapshot, fixture_time()).is_err());

        let mut snapshot = two_manuscript_snapshot();
        snapshot.base_manuscript = 7;
        assert!(run_coherence(&snapshot, fixture_time()).is_err());
    }

    /// Ten-location target; candidate 1 matches six locations, candidate 2
    /// the other four.
    fn greedy_fixture() -> AttestationMatrices {
        let mut matrices = AttestationMatrices::zeros(3, 10);
        for loc in 0..10 {
            matrices.defined[0][loc] = true;
            matrices.labez[0][loc] = 1;
        }
        for loc in 0..6 {
            matrices.defined[1][loc] = true;
            matrices.labez[1][loc] = 1;
        }
        for loc in 6..10 {
            matrices.defined[2][loc] = true;
            matrices.labez[2][loc] = 1;
        }
        matrices
    }

    #[test]
    fn greedy_search_picks_largest_cover_first_and_closes() {
        let matrices = greedy_fixture();
        let entries = match substemma_greedy(&matrices, 0, &[2, 1], 5) {
            Ok(entries) => entries,
            Err(err) => panic!("greedy search should succeed: {err}"),
        };

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].candidates, vec![1], "six beats four");
        assert_eq!(entries[0].equal, 6);
        assert_eq!(entries[0].open, 4);
        assert_eq!(entries[1].candidates, vec![1, 2]);
        assert_eq!(entries[1].equal, 10);
        assert_eq!(entries[1].open, 0);
    }

    #[test]
    fn greedy_search_stops_when_nothing_new_is_explained() {
        let mut matrices = greedy_fixture();
        // Candidate 2 duplicates candidate 1's coverage.
        matrices.defined[2] = matrices.defined[1].clone();
        matrices.labez[2] = matrices.labez[1].clone();

        let entries = match substemma_greedy(&matrices, 0, &[1, 2], 5) {
            Ok(entries) => entries,
            Err(err) => panic!("greedy search should succeed: {err}"),
        };
        assert_eq!(entries.len(), 1, "a redundant candidate is never added");
    }

    #[test]
    fn greedy_search_with_empty_pool_finds_nothing() {
        let matrices = greedy_fixture();
        let entries = match substemma_greedy(&matrices, 0, &[], 5) {
            Ok(entries) => entries,
            Err(err) => panic!("empty pool is not an error: {err}"),
        };
        assert!(entries.is_empty());
    }

    #[test]
    fn unknown_derivation_locations_are_never_explained() {
        let mut matrices = greedy_fixture();
        // Location 0's reading descends straight from the unknown root.
        matrices.parents[0][0] = UNCLEAR_BIT;

        let entries = match substemma_greedy(&matrices, 0, &[1, 2], 5) {
            Ok(entries) => entries,
            Err(err) => panic!("greedy search should succeed: {err}"),
        };
        let last = match entries.last() {
            Some(entry) => entry,
            None => panic!("search should produce at least one step"),
        };
        assert_eq!(last.unknown, 1);
        assert_eq!(last.equal, 9, "the unknown location is outside the explainable pool");
        assert_eq!(last.open, 0);
    }

    #[test]
    fn exhaustive_search_ranks_subsets_and_hints_each_size() {
        let matrices = greedy_fixture();
        let entries = match substemma_exhaustive(&matrices, 0, &[1, 2]) {
            Ok(entries) => entries,
            Err(err) => panic!("exhaustive search should succeed: {err}"),
        };

        assert_eq!(entries.len(), 3, "three non-empty subsets of two candidates");
        assert_eq!(entries[0].candidates, vec![1, 2], "full cover scores highest");
        assert_eq!(entries[0].equal, 10);
        assert!(entries[0].hint);

        let best_single = match entries.iter().find(|entry| entry.size == 1) {
            Some(entry) => entry,
            None => panic!("a size-1 subset should be present"),
        };
        assert_eq!(best_single.candidates, vec![1]);
        assert!(best_single.hint);

        let worst_single = match entries.iter().find(|entry| entry.candidates == vec![2]) {
            Some(entry) => entry,
            None => panic!("subset {{2}} should be present"),
        };
        assert!(!worst_single.hint);
    }

    #[test]
    fn exhaustive_search_rejects_oversized_candidate_sets() {
        let matrices = AttestationMatrices::zeros(40, 4);
        let candidates: Vec<usize> = (1..=(MAX_EXHAUSTIVE_CANDIDATES + 1)).collect();
        let err = match substemma_exhaustive(&matrices, 0, &candidates) {
            Ok(_) => panic!("oversized candidate set must be rejected"),
            Err(err) => err,
        };
        assert!(matches!(err, KernelError::Search(_)));
    }

    #[test]
    fn substemma_rejects_self_and_duplicate_candidates() {
        let matrices = greedy_fixture();
        assert!(substemma_greedy(&matrices, 0, &[0], 3).is_err());
        assert!(substemma_greedy(&matrices, 0, &[1, 1], 3).is_err());
        assert!(substemma_exhaustive(&matrices, 9, &[1]).is_err());
    }

    #[test]
    fn diagnostics_serialize_with_stable_field_names() {
        let mut snapshot = two_manuscript_snapshot();
        snapshot.base_manuscript = 1;
        let run = run_or_panic(&snapshot);

        let value = match serde_json::to_value(&run.diagnostics) {
            Ok(value) => value,
            Err(err) => panic!("diagnostics should serialize: {err}"),
        };
        for key in [
            "cyclic_locations",
            "duplicate_original_locations",
            "disconnected_locations",
            "bit_overflow_locations",
            "stemma_lookup_misses",
            "loop_locations",
            "base_violations",
        ] {
            assert!(value.get(key).is_some(), "missing diagnostics field `{key}`");
        }

        let round_tripped: Diagnostics = match serde_json::from_value(value) {
            Ok(diagnostics) => diagnostics,
            Err(err) => panic!("diagnostics should deserialize: {err}"),
        };
        assert_eq!(round_tripped, run.diagnostics);
    }

    #[test]
    fn snapshot_digest_is_stable_and_content_sensitive() {
        let snapshot = two_manuscript_snapshot();
        assert_eq!(snapshot.digest(), snapshot.digest());

        let mut other = snapshot.clone();
        other.attestations[0].labez = "b".to_string();
        assert_ne!(snapshot.digest(), other.digest());
    }

    proptest! {
        #[test]
        fn property_prefix_counting_matches_naive_count(
            flags in proptest::collection::vec(any::<bool>(), 0..64),
            bounds in (0_usize..64, 0_usize..64),
        ) {
            let (a, b) = bounds;
            let start = a.min(b).min(flags.len());
            let end = a.max(b).min(flags.len());
            let prefix = prefix_counts(&flags);
            let naive =
                u32::try_from(flags[start..end].iter().filter(|&&f| f).count()).unwrap_or(u32::MAX);
            prop_assert_eq!(range_count(&prefix, start, end), naive);
        }
    }

    proptest! {
        #[test]
        fn property_pre_genealogical_matrices_are_symmetric(
            grid in proptest::collection::vec(
                proptest::collection::vec(0_u16..4, 6),
                4,
            ),
        ) {
            let mut matrices = AttestationMatrices::zeros(4, 6);
            for (ms, row) in grid.iter().enumerate() {
                for (loc, &code) in row.iter().enumerate() {
                    matrices.labez[ms][loc] = code;
                    matrices.defined[ms][loc] = code != 0;
                }
            }
            let snapshot = Snapshot {
                manuscript_count: 4,
                location_count: 6,
                base_manuscript: 0,
                ranges: vec![
                    RangeDef { name: "Front".to_string(), start: 0, end: 3 },
                    RangeDef { name: "Back".to_string(), start: 3, end: 6 },
                    RangeDef { name: "All".to_string(), start: 0, end: 6 },
                ],
                stemma_edges: Vec::new(),
                attestations: Vec::new(),
            };

            let result = compute_coherence(&snapshot, &matrices);
            for r in 0..3 {
                for j in 0..4 {
                    for k in 0..4 {
                        prop_assert_eq!(result.and_count[r][j][k], result.and_count[r][k][j]);
                        prop_assert_eq!(result.eq_count[r][j][k], result.eq_count[r][k][j]);
                        prop_assert!(result.eq_count[r][j][k] <= result.and_count[r][j][k]);
                    }
                }
            }
        }
    }
}
