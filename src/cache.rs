use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use ethers_core::types::Address;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::error::{CacheError, NonceError};
use crate::nonce::{NonceBook, NonceStats, ReleaseOutcome};
use crate::types::{AccountState, VenueId, VenueState};

/// Change notification published on every committed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Venue { id: VenueId, height: u64 },
    Account { address: Address, height: u64 },
    Head { height: u64 },
}

/// Latest observed venue reserves, account nonces and chain head.
///
/// Venue and account reads go through `Arc`/copy snapshots in `DashMap`s and
/// never wait on the nonce section. Nonce books live behind one mutex that is
/// only held for the duration of a synchronous bookkeeping call.
pub struct ChainStateCache {
    venues: DashMap<VenueId, Arc<VenueState>>,
    accounts: DashMap<Address, AccountState>,
    books: Mutex<HashMap<Address, NonceBook>>,
    head: AtomicU64,
    max_in_flight: usize,
    sender: broadcast::Sender<StateChange>,
}

impl ChainStateCache {
    pub fn new(max_in_flight: usize, channel_capacity: usize) -> Self {
        let (sender, _recv) = broadcast::channel(channel_capacity.max(1));
        Self {
            venues: DashMap::new(),
            accounts: DashMap::new(),
            books: Mutex::new(HashMap::new()),
            head: AtomicU64::new(0),
            max_in_flight,
            sender,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.sender.subscribe()
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Advances the head. Returns false for heights at or below the current one.
    pub fn set_head(&self, height: u64) -> bool {
        let prev = self.head.fetch_max(height, Ordering::AcqRel);
        if height <= prev {
            return false;
        }
        let _ = self.sender.send(StateChange::Head { height });
        true
    }

    /// Replaces the stored venue. Updates older than the stored height are ignored.
    pub fn update_venue(&self, state: VenueState) -> bool {
        let id = state.id;
        let height = state.height;
        {
            let mut entry = self.venues.entry(id).or_insert_with(|| Arc::new(state.clone()));
            if entry.height > height {
                tracing::debug!(venue = %id, height, stored = entry.height, "ignoring out-of-date venue update");
                return false;
            }
            *entry = Arc::new(state);
        }
        self.set_head(height);
        let _ = self.sender.send(StateChange::Venue { id, height });
        true
    }

    /// Applies an on-chain confirmed nonce observation, creating the account on first sight.
    pub fn update_account(&self, address: Address, confirmed_nonce: u64, height: u64) {
        {
            let mut books = self.books.lock();
            let book = books
                .entry(address)
                .or_insert_with(|| NonceBook::new(address, confirmed_nonce, self.max_in_flight));
            book.advance_confirmed(confirmed_nonce);
            self.publish_account(book, height);
        }
        let _ = self.sender.send(StateChange::Account { address, height });
    }

    pub fn read_venue(&self, id: VenueId) -> Result<Arc<VenueState>, CacheError> {
        self.venues
            .get(&id)
            .map(|v| Arc::clone(v.value()))
            .ok_or(CacheError::VenueNotFound(id))
    }

    /// Snapshot of every tracked venue, ordered by id.
    pub fn venues(&self) -> Vec<Arc<VenueState>> {
        let mut all: Vec<_> = self.venues.iter().map(|v| Arc::clone(v.value())).collect();
        all.sort_by_key(|v| v.id);
        all
    }

    pub fn read_account(&self, address: Address) -> Result<AccountState, CacheError> {
        self.accounts
            .get(&address)
            .map(|a| *a.value())
            .ok_or(CacheError::AccountNotFound(address))
    }

    pub fn reserve_nonce(&self, address: Address) -> Result<u64, NonceError> {
        let mut books = self.books.lock();
        let book = books.get_mut(&address).ok_or(NonceError::UnknownAccount(address))?;
        let result = book.reserve();
        self.after_book_change(book, &result);
        result
    }

    pub fn release_nonce(&self, address: Address, nonce: u64) -> Result<ReleaseOutcome, NonceError> {
        let mut books = self.books.lock();
        let book = books.get_mut(&address).ok_or(NonceError::UnknownAccount(address))?;
        let result = book.release(nonce);
        self.after_book_change(book, &result);
        result
    }

    pub fn confirm_nonce(&self, address: Address, nonce: u64) -> Result<ReleaseOutcome, NonceError> {
        let mut books = self.books.lock();
        let book = books.get_mut(&address).ok_or(NonceError::UnknownAccount(address))?;
        let result = book.confirm(nonce);
        self.after_book_change(book, &result);
        result
    }

    pub fn is_halted(&self, address: Address) -> bool {
        self.books.lock().get(&address).map(NonceBook::is_halted).unwrap_or(false)
    }

    /// Operator action after a fatal nonce violation has been investigated.
    pub fn resume_account(&self, address: Address) -> bool {
        let mut books = self.books.lock();
        match books.get_mut(&address) {
            Some(book) => {
                let reason = book.halt_reason().map(str::to_owned);
                book.resume();
                tracing::warn!(account = ?address, ?reason, "account resumed by operator");
                true
            }
            None => false,
        }
    }

    pub fn nonce_stats(&self, address: Address) -> Option<NonceStats> {
        self.books.lock().get(&address).map(NonceBook::stats)
    }

    fn after_book_change<T>(&self, book: &NonceBook, result: &Result<T, NonceError>) {
        if let Err(e) = result
            && e.is_fatal()
        {
            tracing::error!(error = %e, "nonce invariant violated; bundle construction halted for account");
        }
        self.publish_account(book, self.head());
    }

    fn publish_account(&self, book: &NonceBook, height: u64) {
        let address = book.account();
        let seen = self.accounts.get(&address).map(|a| a.height).unwrap_or(0);
        let state = AccountState {
            address,
            confirmed_nonce: book.confirmed(),
            pending_watermark: book.watermark(),
            height: height.max(seen),
        };
        self.accounts.insert(address, state);
    }
}
