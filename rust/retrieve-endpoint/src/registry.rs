//! The endpoint registry.
//!
//! One shared mapping holds the slot table, the per-slot wake latches and the
//! token table (see [`crate::layout`]). Any process that maps the same file
//! sees the same endpoints. Slot and token contents are only touched through
//! [`Tables`] / [`SharedTables`], which hold the header's reader/writer lock
//! for as long as they live.

use std::ffi::OsStr;
use std::fmt;
use std::mem::size_of;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use retrieve_shm::{Latch, ShmMapping, ShmReadGuard, ShmWriteGuard, current_pid, process_alive};

use crate::config::RegistryConfig;
use crate::error::{EndpointError, Resource};
use crate::layout::{
    EndpointSlot, EndpointState, LayoutError, NAME_LEN, RegistryHeader, RegistryOffsets,
    TokenEntry, truncate_on_char_boundary, write_fixed,
};
use crate::retriever::RetrieveSession;
use crate::segment::{SegmentConfig, SegmentHandle};
use crate::status::{EndpointInfo, RegistryStats};
use crate::token::{Token, TokenStore, lookup_session};

/// Longest cursor-name prefix kept in an endpoint name.
const NAME_PREFIX_LEN: usize = 37;

/// The random suffix is 10 hex digits.
const NAME_RANDOM_MASK: u64 = (1 << 40) - 1;

const _: () = assert!(NAME_PREFIX_LEN + 16 + 10 == NAME_LEN - 1);

/// Identity of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionContext {
    pub session_id: u64,
    pub user_id: u32,
    pub database_id: u32,
}

/// Handle on a registry mapping. Cheap to clone.
#[derive(Clone)]
pub struct EndpointRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    mapping: ShmMapping,
    offsets: RegistryOffsets,
    config: RegistryConfig,
}

/// Exclusive view of the slot and token tables.
pub(crate) struct Tables<'a> {
    pub slots: &'a mut [EndpointSlot],
    pub tokens: &'a mut [TokenEntry],
    _guard: ShmWriteGuard<'a>,
}

/// Shared view of the slot and token tables.
pub(crate) struct SharedTables<'a> {
    pub slots: &'a [EndpointSlot],
    pub tokens: &'a [TokenEntry],
    _guard: ShmReadGuard<'a>,
}

impl EndpointRegistry {
    /// Create a file-backed registry at `path`. Fails if the file exists.
    pub fn create(path: impl AsRef<Path>, config: RegistryConfig) -> Result<Self, EndpointError> {
        config.validate()?;
        std::fs::create_dir_all(&config.segment_dir)?;
        let offsets = RegistryOffsets::calculate(config.max_endpoints)?;
        let mapping = ShmMapping::create(path, offsets.total_size)?;
        Ok(Self::init(mapping, offsets, config))
    }

    /// Registry in anonymous shared memory, visible to this process and to
    /// children forked after this call.
    pub fn anonymous(config: RegistryConfig) -> Result<Self, EndpointError> {
        config.validate()?;
        std::fs::create_dir_all(&config.segment_dir)?;
        let offsets = RegistryOffsets::calculate(config.max_endpoints)?;
        let mapping = ShmMapping::anonymous(offsets.total_size)?;
        Ok(Self::init(mapping, offsets, config))
    }

    fn init(mapping: ShmMapping, offsets: RegistryOffsets, config: RegistryConfig) -> Self {
        let mut token_key = [0u8; 32];
        rand::thread_rng().fill(&mut token_key);
        let region = mapping.region();
        // SAFETY: freshly created zero-filled mapping, nobody else has it yet.
        unsafe { region.get_mut::<RegistryHeader>(0) }.init(
            &config,
            &offsets,
            current_pid(),
            token_key,
        );
        tracing::info!(
            path = ?mapping.path(),
            max_endpoints = config.max_endpoints,
            queue_capacity = config.queue_capacity,
            size = offsets.total_size,
            "endpoint registry created"
        );
        Self {
            inner: Arc::new(RegistryInner {
                mapping,
                offsets,
                config,
            }),
        }
    }

    /// Open an existing registry. Its configuration is read from the header.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EndpointError> {
        let mapping = ShmMapping::open(path)?;
        if mapping.len() < size_of::<RegistryHeader>() {
            return Err(LayoutError::TooSmall {
                required: size_of::<RegistryHeader>(),
                found: mapping.len(),
            }
            .into());
        }
        let region = mapping.region();
        // SAFETY: size checked above; contents validated before use.
        let header = unsafe { region.get::<RegistryHeader>(0) };
        let offsets = header.validate(mapping.len())?;
        let config = RegistryConfig {
            max_endpoints: header.max_endpoints,
            queue_capacity: header.queue_capacity,
            wait_tick: Duration::from_millis(header.wait_tick_ms.into()),
            segment_dir: PathBuf::from(OsStr::from_bytes(header.segment_dir_bytes())),
        };
        tracing::debug!(path = ?mapping.path(), host_pid = header.host_pid, "endpoint registry opened");
        Ok(Self {
            inner: Arc::new(RegistryInner {
                mapping,
                offsets,
                config,
            }),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.mapping.path()
    }

    /// Remove the backing file. Processes that already mapped it keep working.
    pub fn unlink(&self) -> std::io::Result<()> {
        self.inner.mapping.unlink()
    }

    pub fn wait_tick(&self) -> Duration {
        self.inner.config.wait_tick
    }

    pub(crate) fn segment_config(&self) -> SegmentConfig {
        SegmentConfig {
            dir: self.inner.config.segment_dir.clone(),
            capacity: self.inner.config.queue_capacity,
        }
    }

    fn header(&self) -> &RegistryHeader {
        let region = self.inner.mapping.region();
        // SAFETY: validated (or initialized) when the registry was built; the
        // mapping lives as long as self.
        unsafe { &*region.ptr::<RegistryHeader>(0) }
    }

    /// Wake latch of slot `index`. Usable without the lock.
    pub(crate) fn latch(&self, index: usize) -> &Latch {
        let region = self.inner.mapping.region();
        let offset = self.inner.offsets.latch_table + index * size_of::<Latch>();
        // SAFETY: the latch table holds max_endpoints latches and all-zero
        // is a valid latch. `ptr` panics on an out-of-range index.
        unsafe { &*region.ptr::<Latch>(offset) }
    }

    fn token_store<'t>(&self, tokens: &'t mut [TokenEntry]) -> TokenStore<'t> {
        TokenStore::new(tokens, self.header().token_key)
    }

    pub(crate) fn lock_exclusive(&self) -> Tables<'_> {
        let guard = self.header().lock.write();
        let region = self.inner.mapping.region();
        let n = self.inner.offsets.max_endpoints;
        // SAFETY: both tables hold exactly max_endpoints entries, all-zero is
        // valid for both, and the write guard excludes every other accessor.
        unsafe {
            Tables {
                slots: std::slice::from_raw_parts_mut(
                    region.ptr::<EndpointSlot>(self.inner.offsets.slot_table),
                    n,
                ),
                tokens: std::slice::from_raw_parts_mut(
                    region.ptr::<TokenEntry>(self.inner.offsets.token_table),
                    n,
                ),
                _guard: guard,
            }
        }
    }

    pub(crate) fn lock_shared(&self) -> SharedTables<'_> {
        let guard = self.header().lock.read();
        let region = self.inner.mapping.region();
        let n = self.inner.offsets.max_endpoints;
        // SAFETY: as in lock_exclusive; the read guard excludes writers.
        unsafe {
            SharedTables {
                slots: std::slice::from_raw_parts(
                    region.ptr::<EndpointSlot>(self.inner.offsets.slot_table),
                    n,
                ),
                tokens: std::slice::from_raw_parts(
                    region.ptr::<TokenEntry>(self.inner.offsets.token_table),
                    n,
                ),
                _guard: guard,
            }
        }
    }

    // =========================================================================
    // Sessions and tokens
    // =========================================================================

    /// Start a session with a fresh session id.
    pub fn begin_session(&self, user_id: u32, database_id: u32) -> SessionContext {
        let session_id = self.header().next_session_id.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(session_id, user_id, database_id, "session started");
        SessionContext {
            session_id,
            user_id,
            database_id,
        }
    }

    /// End a session: its token entry goes away unless endpoints still use it.
    pub fn end_session(&self, session: &SessionContext) -> bool {
        let mut tables = self.lock_exclusive();
        let removed = self
            .token_store(&mut *tables.tokens)
            .remove_if_unused(session.session_id, session.user_id);
        drop(tables);
        tracing::debug!(session_id = session.session_id, removed, "session ended");
        removed
    }

    /// Token that lets retrievers of `user_id` reach this session's endpoints.
    pub fn session_token(&self, session_id: u64, user_id: u32) -> Result<Token, EndpointError> {
        let mut tables = self.lock_exclusive();
        self.token_store(&mut *tables.tokens)
            .get_or_create(session_id, user_id)
    }

    /// Resolve `token_text` to a session of `user_id` and bind a retriever to
    /// it. Never says which part was wrong.
    pub fn authenticate(
        &self,
        user_id: u32,
        database_id: u32,
        token_text: &str,
    ) -> Result<RetrieveSession, EndpointError> {
        let token = Token::parse(token_text)?;
        let session_id = {
            let tables = self.lock_shared();
            lookup_session(tables.tokens, user_id, &token)
        };
        match session_id {
            Some(session_id) => {
                tracing::debug!(session_id, user_id, database_id, "retriever authenticated");
                Ok(RetrieveSession::new(
                    self.clone(),
                    SessionContext {
                        session_id,
                        user_id,
                        database_id,
                    },
                ))
            }
            None => {
                tracing::debug!(user_id, "retriever authentication failed");
                Err(EndpointError::AuthenticationFailed)
            }
        }
    }

    // =========================================================================
    // Endpoints
    // =========================================================================

    /// Publish a READY endpoint for `cursor_name` whose rows travel through
    /// the segment `queue`.
    ///
    /// Slot scan, token reference and name generation happen under one
    /// exclusive lock, so concurrent allocations never hand out the same slot
    /// or name.
    pub fn allocate(
        &self,
        session: &SessionContext,
        cursor_name: &str,
        queue: SegmentHandle,
    ) -> Result<EndpointLease, EndpointError> {
        let pid = current_pid();
        let mut tables = self.lock_exclusive();

        let Some(index) = tables.slots.iter().position(EndpointSlot::is_free) else {
            tracing::warn!(
                max_endpoints = tables.slots.len(),
                cursor = cursor_name,
                "no free endpoint slot"
            );
            return Err(EndpointError::ResourceExhausted(Resource::EndpointSlots));
        };
        self.token_store(&mut *tables.tokens)
            .acquire(session.session_id, session.user_id)?;

        let mut rng = rand::thread_rng();
        let name = loop {
            let candidate = endpoint_name(cursor_name, session.session_id, &mut rng);
            if !tables
                .slots
                .iter()
                .any(|s| !s.is_free() && s.name() == candidate)
            {
                break candidate;
            }
            tracing::debug!(name = %candidate, "endpoint name collision");
        };

        let slot = &mut tables.slots[index];
        write_fixed(&mut slot.name, &name);
        write_fixed(&mut slot.cursor_name, cursor_name);
        slot.session_id = session.session_id;
        slot.queue_handle = queue.as_raw();
        slot.database_id = session.database_id;
        slot.user_id = session.user_id;
        slot.generation = slot.generation.wrapping_add(1);
        slot.in_use = 1;
        slot.set_state(EndpointState::Ready);
        slot.sender_pid = pid;
        slot.receiver_pid = 0;
        let generation = slot.generation;

        let latch = self.latch(index);
        latch.own(pid);
        latch.reset();
        drop(tables);

        tracing::debug!(endpoint = %name, index, session_id = session.session_id, segment = %queue, "endpoint allocated");
        Ok(EndpointLease {
            registry: self.clone(),
            index,
            generation,
            name,
            session: *session,
            freed: false,
        })
    }

    /// Look up an endpoint by name within one session and database.
    pub fn find(
        &self,
        name: &str,
        session_id: u64,
        database_id: u32,
    ) -> Result<EndpointInfo, EndpointError> {
        let tables = self.lock_shared();
        find_slot(tables.slots, name, session_id, database_id)
            .map(|i| EndpointInfo::from_slot(&tables.slots[i]))
            .ok_or_else(|| EndpointError::NotFound {
                name: name.to_owned(),
            })
    }

    /// Tear down an endpoint and drop its token reference.
    pub fn free(&self, lease: EndpointLease) {
        lease.free();
    }

    /// Free slot `index` if it still carries `generation`.
    fn free_slot(&self, index: usize, generation: u32) -> bool {
        let mut tables = self.lock_exclusive();
        let slot = &mut tables.slots[index];
        if slot.is_free() || slot.generation != generation {
            tracing::warn!(index, generation, "stale endpoint handle, slot not freed");
            return false;
        }
        let (session_id, user_id) = (slot.session_id, slot.user_id);
        tracing::debug!(endpoint = slot.name(), index, state = %slot.state(), "endpoint freed");
        slot.clear();
        self.token_store(&mut *tables.tokens)
            .release(session_id, user_id);
        let latch = self.latch(index);
        latch.disown();
        latch.reset();
        true
    }

    /// Every endpoint in use.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.endpoints_where(|_| true)
    }

    pub fn endpoints_in_database(&self, database_id: u32) -> Vec<EndpointInfo> {
        self.endpoints_where(|s| s.database_id == database_id)
    }

    pub(crate) fn endpoints_where(&self, mut keep: impl FnMut(&EndpointSlot) -> bool) -> Vec<EndpointInfo> {
        let tables = self.lock_shared();
        tables
            .slots
            .iter()
            .filter(|s| !s.is_free() && keep(s))
            .map(EndpointInfo::from_slot)
            .collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let tables = self.lock_shared();
        RegistryStats {
            endpoints_in_use: tables.slots.iter().filter(|s| !s.is_free()).count(),
            max_endpoints: tables.slots.len(),
            tokens_in_use: tables.tokens.iter().filter(|t| t.in_use != 0).count(),
            max_tokens: tables.tokens.len(),
            shutting_down: self.is_shutting_down(),
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Flag the process group as shutting down and wake every endpoint.
    pub fn begin_shutdown(&self) {
        if self.header().shutdown.swap(1, Ordering::AcqRel) != 0 {
            return;
        }
        tracing::info!("endpoint registry shutting down");
        let tables = self.lock_shared();
        for (index, _) in tables.slots.iter().enumerate().filter(|(_, s)| !s.is_free()) {
            self.latch(index).set();
        }
    }

    /// Shutdown was requested, or the process that created the registry is
    /// gone.
    pub fn is_shutting_down(&self) -> bool {
        let header = self.header();
        header.is_shutting_down() || !process_alive(header.host_pid)
    }
}

impl fmt::Debug for EndpointRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointRegistry")
            .field("path", &self.path())
            .field("config", &self.inner.config)
            .finish()
    }
}

/// Index of the in-use slot called `name` in the given session and database.
pub(crate) fn find_slot(
    slots: &[EndpointSlot],
    name: &str,
    session_id: u64,
    database_id: u32,
) -> Option<usize> {
    slots.iter().position(|s| {
        !s.is_free() && s.session_id == session_id && s.database_id == database_id && s.name() == name
    })
}

/// `{cursor prefix}{session id, 16 hex}{random, 10 hex}`.
fn endpoint_name(cursor_name: &str, session_id: u64, rng: &mut impl Rng) -> String {
    let prefix = truncate_on_char_boundary(cursor_name, NAME_PREFIX_LEN);
    let suffix = rng.r#gen::<u64>() & NAME_RANDOM_MASK;
    format!("{prefix}{session_id:016x}{suffix:010x}")
}

/// Ownership of one allocated endpoint slot.
///
/// Freed by [`EndpointLease::free`], or on drop with a warning. A lease never
/// touches a slot that was freed and allocated again since.
pub struct EndpointLease {
    registry: EndpointRegistry,
    index: usize,
    generation: u32,
    name: String,
    session: SessionContext,
    freed: bool,
}

impl EndpointLease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub fn latch(&self) -> &Latch {
        self.registry.latch(self.index)
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Modify the slot under the exclusive lock. `None` if it is no longer
    /// this lease's slot.
    pub fn update<R>(&self, f: impl FnOnce(&mut EndpointSlot) -> R) -> Option<R> {
        let mut tables = self.registry.lock_exclusive();
        let slot = &mut tables.slots[self.index];
        (!slot.is_free() && slot.generation == self.generation).then(|| f(slot))
    }

    /// Read the slot under the shared lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&EndpointSlot) -> R) -> Option<R> {
        let tables = self.registry.lock_shared();
        let slot = &tables.slots[self.index];
        (!slot.is_free() && slot.generation == self.generation).then(|| f(slot))
    }

    pub fn state(&self) -> Option<EndpointState> {
        self.inspect(EndpointSlot::state)
    }

    /// Pid of the attached receiver, if any.
    pub fn receiver_pid(&self) -> Option<u32> {
        self.inspect(|s| s.receiver_pid).filter(|&pid| pid != 0)
    }

    pub fn free(mut self) {
        self.free_slot();
    }

    fn free_slot(&mut self) {
        if std::mem::replace(&mut self.freed, true) {
            return;
        }
        self.registry.free_slot(self.index, self.generation);
    }
}

impl Drop for EndpointLease {
    fn drop(&mut self) {
        if !self.freed {
            tracing::warn!(endpoint = %self.name, "endpoint lease dropped without free");
            self.free_slot();
        }
    }
}

impl fmt::Debug for EndpointLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointLease")
            .field("name", &self.name)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::TOKEN_LEN;
    use std::collections::HashSet;

    fn registry(max_endpoints: u32) -> EndpointRegistry {
        EndpointRegistry::anonymous(
            RegistryConfig::default()
                .with_max_endpoints(max_endpoints)
                .with_segment_dir(std::env::temp_dir()),
        )
        .unwrap()
    }

    fn queue() -> SegmentHandle {
        SegmentHandle::from_raw(0x1234).unwrap()
    }

    #[test]
    fn allocate_then_find() {
        let registry = registry(8);
        let session = registry.begin_session(10, 5);
        let lease = registry.allocate(&session, "c1", queue()).unwrap();

        let info = registry
            .find(lease.name(), session.session_id, session.database_id)
            .unwrap();
        assert_eq!(info.cursor_name, "c1");
        assert_eq!(info.state, EndpointState::Ready);
        assert_eq!(info.sender_pid, std::process::id());
        assert!(info.sender_alive);
        assert_eq!(info.receiver_pid, 0);
        assert_eq!(info.queue_handle, Some(queue()));

        for (session_id, database_id) in [(session.session_id + 1, 5), (session.session_id, 6)] {
            assert!(matches!(
                registry.find(lease.name(), session_id, database_id),
                Err(EndpointError::NotFound { .. })
            ));
        }
        lease.free();
        assert!(registry.endpoints().is_empty());
    }

    #[test]
    fn names_are_unique_and_bounded() {
        let registry = registry(64);
        let session = registry.begin_session(1, 1);
        let cursor = "a_very_long_cursor_name_that_keeps_going_and_going_well_past_the_limit";
        let leases: Vec<_> = (0..64)
            .map(|_| registry.allocate(&session, cursor, queue()).unwrap())
            .collect();
        let names: HashSet<&str> = leases.iter().map(|l| l.name()).collect();
        assert_eq!(names.len(), 64);
        for name in &names {
            assert!(name.len() <= NAME_LEN - 1);
            assert!(name.starts_with(&cursor[..NAME_PREFIX_LEN]));
            assert!(name.contains(&format!("{:016x}", session.session_id)));
        }
        assert!(matches!(
            registry.allocate(&session, cursor, queue()),
            Err(EndpointError::ResourceExhausted(Resource::EndpointSlots))
        ));
    }

    #[test]
    fn multibyte_cursor_prefix_is_cut_on_char_boundary() {
        let mut rng = rand::thread_rng();
        let name = endpoint_name(&"ü".repeat(30), 7, &mut rng);
        assert!(name.len() <= NAME_LEN - 1);
        assert!(name.starts_with(&"ü".repeat(18)));
    }

    #[test]
    fn endpoints_of_a_session_share_one_token() {
        let registry = registry(4);
        let session = registry.begin_session(42, 1);
        let a = registry.allocate(&session, "a", queue()).unwrap();
        let b = registry.allocate(&session, "b", queue()).unwrap();
        {
            let mut tables = registry.lock_exclusive();
            let store = registry.token_store(&mut *tables.tokens);
            assert_eq!(store.in_use(), 1);
            assert_eq!(store.ref_count(session.session_id, 42), Some(2));
        }
        a.free();
        b.free();
        assert_eq!(registry.stats().tokens_in_use, 1, "kept until the session ends");
        assert!(registry.end_session(&session));
        assert_eq!(registry.stats().tokens_in_use, 0);
    }

    #[test]
    fn token_is_stable_for_the_session() {
        let registry = registry(4);
        let session = registry.begin_session(42, 1);
        let first = registry.session_token(session.session_id, 42).unwrap();
        registry.allocate(&session, "a", queue()).unwrap().free();
        assert!(registry.end_session(&session));
        assert_eq!(registry.stats().tokens_in_use, 0);

        let lease = registry.allocate(&session, "b", queue()).unwrap();
        assert_eq!(registry.session_token(session.session_id, 42).unwrap(), first);
        let bound = registry.authenticate(42, 1, &first.to_string()).unwrap();
        assert_eq!(bound.session().session_id, session.session_id);
        lease.free();

        let other = registry.begin_session(42, 1);
        assert_ne!(registry.session_token(other.session_id, 42).unwrap(), first);
    }

    #[test]
    fn end_session_keeps_token_in_use() {
        let registry = registry(4);
        let session = registry.begin_session(42, 1);
        let lease = registry.allocate(&session, "a", queue()).unwrap();
        assert!(!registry.end_session(&session));
        lease.free();
        assert!(registry.end_session(&session));
    }

    #[test]
    fn stale_generation_does_not_free_reused_slot() {
        let registry = registry(1);
        let session = registry.begin_session(1, 1);
        let first = registry.allocate(&session, "a", queue()).unwrap();
        let old_generation = first.generation;
        first.free();
        let second = registry.allocate(&session, "b", queue()).unwrap();
        assert_ne!(second.generation, old_generation);
        assert!(!registry.free_slot(0, old_generation));
        assert_eq!(registry.endpoints().len(), 1);
        second.free();
    }

    #[test]
    fn dropped_lease_is_freed() {
        let registry = registry(2);
        let session = registry.begin_session(1, 1);
        drop(registry.allocate(&session, "a", queue()).unwrap());
        assert_eq!(registry.stats().endpoints_in_use, 0);
    }

    #[test]
    fn authenticate_binds_the_right_session() {
        let registry = registry(4);
        let session = registry.begin_session(7, 3);
        let token = registry
            .session_token(session.session_id, session.user_id)
            .unwrap();

        let bound = registry.authenticate(7, 3, &token.to_string()).unwrap();
        assert_eq!(bound.session().session_id, session.session_id);

        // Right session id, wrong secret.
        let mut bytes = *token.as_bytes();
        bytes[TOKEN_LEN - 1] ^= 1;
        let forged = Token::from_bytes(bytes);

        for (user, text) in [
            (8, token.to_string()),
            (7, "tk00".to_string()),
            (7, forged.to_string()),
        ] {
            assert!(matches!(
                registry.authenticate(user, 3, &text),
                Err(EndpointError::AuthenticationFailed)
            ));
        }
    }

    #[test]
    fn session_ids_increase() {
        let registry = registry(1);
        let a = registry.begin_session(1, 1);
        let b = registry.begin_session(1, 1);
        assert!(b.session_id > a.session_id);
        assert_ne!(a.session_id, 0);
    }

    #[test]
    fn shutdown_wakes_endpoint_latches() {
        let registry = registry(2);
        let session = registry.begin_session(1, 1);
        let lease = registry.allocate(&session, "a", queue()).unwrap();
        assert!(!lease.latch().is_set());
        assert!(!registry.is_shutting_down());
        registry.begin_shutdown();
        assert!(registry.is_shutting_down());
        assert!(lease.latch().is_set());
        assert!(registry.stats().shutting_down);
    }

    #[test]
    fn file_registry_is_shared_between_handles() {
        let dir = std::env::temp_dir().join(format!("test_registry_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("registry");
        let config = RegistryConfig::default()
            .with_max_endpoints(16)
            .with_queue_capacity(4096)
            .with_wait_tick(Duration::from_millis(25))
            .with_segment_dir(&dir);
        let host = EndpointRegistry::create(&path, config.clone()).unwrap();
        let session = host.begin_session(1, 2);
        let lease = host.allocate(&session, "shared", queue()).unwrap();

        let other = EndpointRegistry::open(&path).unwrap();
        assert_eq!(other.config(), &config);
        let info = other.find(lease.name(), session.session_id, 2).unwrap();
        assert_eq!(info.name, lease.name());

        assert!(EndpointRegistry::create(&path, config).is_err());
        lease.free();
        host.unlink().unwrap();
        std::fs::remove_dir_all(&dir).ok();
    }
}
