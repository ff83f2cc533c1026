//! Loop tokens and the generation-based memory manager.
//!
//! Compiled traces are owned by [`LoopToken`]s. The [`MemoryManager`] is
//! the single strong owner, keyed by [`TokenId`]; jit cells and jumps
//! between traces only hold ids.
//!
//! ```text
//!   generation:  0 ── 1 ── 2 ── ... ── g ── ... ── g + max_age
//!                          ▲                        ▲
//!                  keep_loop_alive(T)        T may be freed here,
//!                  stamps T with g           unless a live token
//!                                            jumps to it
//! ```
//!
//! A sweep runs every `check_frequency = max(1, sqrt(max_age))`
//! generations. Tokens that are old (or invalidated) are freed unless
//! they are reachable through `jumps_to` edges from a token that stays.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::debug;

use crate::backend::ExecuteToken;
use crate::compile::GuardDescr;
use crate::jitlog;
use crate::warmstate::{EntryKind, GreenKey};

// =============================================================================
// LoopToken
// =============================================================================

/// Identifier of a compiled loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(pub u64);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Loop{}>", self.0)
    }
}

/// Handle to one compiled trace and its metadata.
#[derive(Debug)]
pub struct LoopToken {
    /// Identifier.
    pub id: TokenId,
    /// Driver that owns the green key.
    pub driver: usize,
    /// Green key the token is attached to.
    pub greenkey: GreenKey,
    /// Loop header or function entry.
    pub entry: EntryKind,
    /// Argument shapes accepted on entry.
    pub execute: ExecuteToken,
    generation: AtomicU64,
    invalidated: AtomicBool,
    jumps_to: Mutex<FxHashSet<TokenId>>,
    bridge_count: AtomicU32,
    bridge_roots: Mutex<FxHashSet<u64>>,
    descrs: Mutex<Vec<Arc<GuardDescr>>>,
}

impl LoopToken {
    /// Create a token for the given key.
    pub fn new(id: TokenId, driver: usize, greenkey: GreenKey, entry: EntryKind, execute: ExecuteToken) -> Self {
        Self {
            id,
            driver,
            greenkey,
            entry,
            execute,
            generation: AtomicU64::new(0),
            invalidated: AtomicBool::new(false),
            jumps_to: Mutex::new(FxHashSet::default()),
            bridge_count: AtomicU32::new(0),
            bridge_roots: Mutex::new(FxHashSet::default()),
            descrs: Mutex::new(Vec::new()),
        }
    }

    /// Generation of the last use.
    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether the token has been invalidated.
    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }

    /// Mark the token invalidated; returns whether it was valid before.
    pub fn invalidate(&self) -> bool {
        !self.invalidated.swap(true, Ordering::AcqRel)
    }

    /// Record that compiled code of this token jumps to `target`.
    pub fn record_jump_to(&self, target: TokenId) {
        if target != self.id {
            self.jumps_to.lock().insert(target);
        }
    }

    /// Tokens this one jumps to.
    pub fn jumps_to(&self) -> Vec<TokenId> {
        let mut targets: Vec<TokenId> = self.jumps_to.lock().iter().copied().collect();
        targets.sort();
        targets
    }

    /// Number of bridges attached to guards of this token.
    #[inline]
    pub fn bridge_count(&self) -> u32 {
        self.bridge_count.load(Ordering::Acquire)
    }

    /// Count one more attached bridge.
    pub fn add_bridge(&self) -> u32 {
        self.bridge_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Admit `guard` as a bridge root unless `max_roots` distinct guards
    /// already started bridge tracing. A guard already admitted may retry.
    pub fn admit_bridge_root(&self, guard: u64, max_roots: u32) -> bool {
        let mut roots = self.bridge_roots.lock();
        if roots.contains(&guard) {
            return true;
        }
        if roots.len() >= max_roots as usize {
            return false;
        }
        roots.insert(guard);
        true
    }

    /// Take ownership of the descrs of a compiled trace.
    pub fn add_descrs(&self, descrs: impl IntoIterator<Item = Arc<GuardDescr>>) {
        self.descrs.lock().extend(descrs);
    }

    /// Number of guard and finish descrs owned by the token.
    pub fn num_descrs(&self) -> usize {
        self.descrs.lock().len()
    }

    /// Descr with the given id, if owned by this token.
    pub fn descr(&self, id: u64) -> Option<Arc<GuardDescr>> {
        self.descrs.lock().iter().find(|d| d.id() == id).cloned()
    }

    fn stamp(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }
}

// =============================================================================
// MemoryManager
// =============================================================================

/// Owns every live token and frees the ones that are no longer used.
#[derive(Debug)]
pub struct MemoryManager {
    max_age: u64,
    check_frequency: u64,
    current_generation: u64,
    next_check: Option<u64>,
    alive: FxHashMap<TokenId, Arc<LoopToken>>,
}

impl MemoryManager {
    /// A manager freeing tokens unused for `max_age` generations.
    pub fn new(max_age: u64) -> Self {
        let mut mm = Self {
            max_age: 0,
            check_frequency: 1,
            current_generation: 0,
            next_check: None,
            alive: FxHashMap::default(),
        };
        mm.set_max_age(max_age);
        mm
    }

    /// Change the longevity; `0` disables freeing.
    pub fn set_max_age(&mut self, max_age: u64) {
        if max_age == 0 {
            self.max_age = 0;
            self.next_check = None;
            return;
        }
        self.max_age = max_age;
        self.check_frequency = ((max_age as f64).sqrt() as u64).max(1);
        self.next_check = Some(self.current_generation + 1);
    }

    /// Current longevity.
    #[inline]
    pub fn max_age(&self) -> u64 {
        self.max_age
    }

    /// Generations between two sweeps.
    #[inline]
    pub fn check_frequency(&self) -> u64 {
        self.check_frequency
    }

    /// Current generation.
    #[inline]
    pub fn current_generation(&self) -> u64 {
        self.current_generation
    }

    /// Start a new generation; sweeps when one is due. Returns the freed
    /// tokens.
    pub fn next_generation(&mut self) -> Vec<Arc<LoopToken>> {
        self.current_generation += 1;
        match self.next_check {
            Some(check) if self.current_generation >= check => {
                self.next_check = Some(self.current_generation + self.check_frequency);
                self.collect_now()
            }
            _ => Vec::new(),
        }
    }

    /// Stamp `token` as used in the current generation.
    #[inline]
    pub fn keep_loop_alive(&self, token: &LoopToken) {
        token.stamp(self.current_generation);
    }

    /// Take ownership of a freshly compiled token.
    pub fn register(&mut self, token: Arc<LoopToken>) {
        self.keep_loop_alive(&token);
        self.alive.insert(token.id, token);
    }

    /// Live token with the given id.
    pub fn get(&self, id: TokenId) -> Option<&Arc<LoopToken>> {
        self.alive.get(&id)
    }

    /// Number of live tokens.
    pub fn num_alive(&self) -> usize {
        self.alive.len()
    }

    /// Ids of all live tokens.
    pub fn alive_ids(&self) -> Vec<TokenId> {
        let mut ids: Vec<TokenId> = self.alive.keys().copied().collect();
        ids.sort();
        ids
    }

    fn is_old(&self, token: &LoopToken) -> bool {
        self.max_age > 0 && token.generation() + self.max_age <= self.current_generation
    }

    /// Whether the token is past its longevity (or invalidated).
    pub fn is_expired(&self, id: TokenId) -> bool {
        self.alive
            .get(&id)
            .map_or(false, |t| t.is_invalidated() || self.is_old(t))
    }

    /// Tokens a sweep would free right now.
    pub fn collectable(&self) -> FxHashSet<TokenId> {
        let mut keep: Vec<TokenId> = self
            .alive
            .values()
            .filter(|t| !t.is_invalidated() && !self.is_old(t))
            .map(|t| t.id)
            .collect();
        let mut reached: FxHashSet<TokenId> = keep.iter().copied().collect();
        while let Some(id) = keep.pop() {
            if let Some(token) = self.alive.get(&id) {
                for target in token.jumps_to() {
                    if reached.insert(target) {
                        keep.push(target);
                    }
                }
            }
        }
        self.alive
            .keys()
            .filter(|id| !reached.contains(id))
            .copied()
            .collect()
    }

    /// Free every collectable token now.
    pub fn collect_now(&mut self) -> Vec<Arc<LoopToken>> {
        let dead = self.collectable();
        let mut freed: Vec<Arc<LoopToken>> = dead.iter().filter_map(|id| self.alive.remove(id)).collect();
        freed.sort_by_key(|t| t.id);
        if !freed.is_empty() {
            debug!(
                target: jitlog::MEM_COLLECT,
                generation = self.current_generation,
                freed = freed.len(),
                alive = self.alive.len(),
                "freed loops {:?}",
                freed.iter().map(|t| t.id.0).collect::<Vec<_>>()
            );
        }
        freed
    }

    /// Restamp every token with the current generation and re-arm the
    /// sweep. Used in a forked child.
    pub fn reanchor(&mut self) {
        for token in self.alive.values() {
            token.stamp(self.current_generation);
        }
        if self.max_age > 0 {
            self.next_check = Some(self.current_generation + 1);
        }
    }
}
