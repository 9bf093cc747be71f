use std::borrow::Cow;
use std::collections::HashMap;
use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

use byteorder::{BigEndian, ByteOrder};
use enum_iterator::Sequence;
use heed::types::{Bytes, DecodeIgnore, Unit};
use heed::{BoxedError, Env, RoTxn, RwTxn};
use roaring::RoaringBitmap;

use crate::key::{PairKey, PairKeyCodec, PairPrefixCodec};
use crate::{BEU32, BEU64, Error, FileId, ReasonId, Result, ServiceId};

/// The service registry the store consults: which ids play which role. The
/// ids themselves come from the application's service table; the store never
/// allocates them. The combined sentinel is defined to contain every file and
/// owns no state rows of its own.
#[derive(Debug, Clone)]
pub struct Services {
    combined_files: ServiceId,
    combined_local_files: ServiceId,
    trash: ServiceId,
    local_domains: Vec<ServiceId>,
    remotes: Vec<ServiceId>,
}

impl Services {
    pub fn new(
        combined_files: ServiceId,
        combined_local_files: ServiceId,
        trash: ServiceId,
    ) -> Services {
        Services {
            combined_files,
            combined_local_files,
            trash,
            local_domains: Vec::new(),
            remotes: Vec::new(),
        }
    }

    pub fn with_local_domains(mut self, local_domains: Vec<ServiceId>) -> Services {
        self.local_domains = local_domains;
        self
    }

    pub fn with_remotes(mut self, remotes: Vec<ServiceId>) -> Services {
        self.remotes = remotes;
        self
    }

    /// The sentinel service defined to contain every file.
    pub fn combined_files(&self) -> ServiceId {
        self.combined_files
    }

    pub fn combined_local_files(&self) -> ServiceId {
        self.combined_local_files
    }

    pub fn trash(&self) -> ServiceId {
        self.trash
    }

    /// Every service that owns state rows: all of them but the combined
    /// sentinel.
    pub fn specific(&self) -> Vec<ServiceId> {
        let mut service_ids = vec![self.combined_local_files, self.trash];
        service_ids.extend_from_slice(&self.local_domains);
        service_ids.extend_from_slice(&self.remotes);
        service_ids
    }

    /// The local services whose delete records are subject to the trash
    /// gate: the combined local domain and the real local domains.
    pub fn local_non_trash(&self) -> Vec<ServiceId> {
        let mut service_ids = vec![self.combined_local_files];
        service_ids.extend_from_slice(&self.local_domains);
        service_ids
    }
}

/// The four per-service states a file id can be in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Sequence)]
pub enum FileStatus {
    Current,
    Deleted,
    Pending,
    Petitioned,
}

/// A deletion record: when the file was deleted here and when it was
/// originally admitted.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DeletedRow {
    pub timestamp: u64,
    pub original_timestamp: u64,
}

pub enum DeletedRowCodec {}

impl<'a> heed::BytesEncode<'a> for DeletedRowCodec {
    type EItem = DeletedRow;

    fn bytes_encode(row: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, BoxedError> {
        let mut output = Vec::with_capacity(2 * size_of::<u64>());
        output.extend_from_slice(&row.timestamp.to_be_bytes());
        output.extend_from_slice(&row.original_timestamp.to_be_bytes());

        Ok(Cow::Owned(output))
    }
}

impl heed::BytesDecode<'_> for DeletedRowCodec {
    type DItem = DeletedRow;

    fn bytes_decode(bytes: &[u8]) -> std::result::Result<Self::DItem, BoxedError> {
        let timestamp = BigEndian::read_u64(bytes);
        let original_timestamp = BigEndian::read_u64(&bytes[size_of::<u64>()..]);

        Ok(DeletedRow { timestamp, original_timestamp })
    }
}

/// Per-service file state: which files are current, deleted, pending or
/// petitioned in every service, plus the process-wide deletion reasons.
///
/// Rows are keyed `(service_id, file_id)` so one service's set is one
/// contiguous range; the similarity index consumes [`current_file_ids`] of
/// the combined local domain to decide which phashes are still worth
/// indexing.
///
/// [`current_file_ids`]: FileStore::current_file_ids
#[derive(Debug, Clone)]
pub struct FileStore {
    current: heed::Database<PairKeyCodec, BEU64>,
    deleted: heed::Database<PairKeyCodec, DeletedRowCodec>,
    pending: heed::Database<PairKeyCodec, Unit>,
    petitioned: heed::Database<PairKeyCodec, BEU32>,
    deletion_reasons: heed::Database<BEU32, BEU32>,
    services: Services,
}

impl FileStore {
    const CURRENT: &'static str = "current-files";
    const DELETED: &'static str = "deleted-files";
    const PENDING: &'static str = "pending-files";
    const PETITIONED: &'static str = "petitioned-files";
    const DELETION_REASONS: &'static str = "deletion-reasons";

    /// The number of named databases the store needs; see
    /// [`Index::NB_DBS`](crate::Index::NB_DBS).
    pub const NB_DBS: u32 = 5;

    pub fn create(env: &Env, wtxn: &mut RwTxn, services: Services) -> Result<FileStore> {
        Ok(FileStore {
            current: env.create_database(wtxn, Some(Self::CURRENT))?,
            deleted: env.create_database(wtxn, Some(Self::DELETED))?,
            pending: env.create_database(wtxn, Some(Self::PENDING))?,
            petitioned: env.create_database(wtxn, Some(Self::PETITIONED))?,
            deletion_reasons: env.create_database(wtxn, Some(Self::DELETION_REASONS))?,
            services,
        })
    }

    pub fn open(env: &Env, rtxn: &RoTxn, services: Services) -> Result<FileStore> {
        fn open_db<KC: 'static, DC: 'static>(
            env: &Env,
            rtxn: &RoTxn,
            name: &'static str,
        ) -> Result<heed::Database<KC, DC>> {
            env.open_database(rtxn, Some(name))?.ok_or(Error::MissingDatabase(name))
        }

        Ok(FileStore {
            current: open_db(env, rtxn, Self::CURRENT)?,
            deleted: open_db(env, rtxn, Self::DELETED)?,
            pending: open_db(env, rtxn, Self::PENDING)?,
            petitioned: open_db(env, rtxn, Self::PETITIONED)?,
            deletion_reasons: open_db(env, rtxn, Self::DELETION_REASONS)?,
            services,
        })
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// One status table with its value type erased, for the operations that
    /// treat all four uniformly.
    fn raw(&self, status: FileStatus) -> heed::Database<PairKeyCodec, Bytes> {
        match status {
            FileStatus::Current => self.current.remap_data_type(),
            FileStatus::Deleted => self.deleted.remap_data_type(),
            FileStatus::Pending => self.pending.remap_data_type(),
            FileStatus::Petitioned => self.petitioned.remap_data_type(),
        }
    }

    /// Admits files into the service's current set, keeping the original
    /// admission timestamp of files already there, and drops their pending
    /// rows. Returns whether any pending row changed.
    pub fn add_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        rows: &[(FileId, u64)],
    ) -> Result<bool> {
        let mut pending_changed = false;
        for &(file_id, timestamp) in rows {
            let key = PairKey::new(service_id, file_id);
            if self.current.get(wtxn, &key)?.is_none() {
                self.current.put(wtxn, &key, &timestamp)?;
            }
            pending_changed |= self.pending.delete(wtxn, &key)?;
        }

        Ok(pending_changed)
    }

    /// Removes files from the service's current and petitioned sets. Returns
    /// whether any petitioned row changed.
    pub fn remove_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<bool> {
        let mut petitioned_changed = false;
        for &file_id in file_ids {
            let key = PairKey::new(service_id, file_id);
            self.current.delete(wtxn, &key)?;
            petitioned_changed |= self.petitioned.delete(wtxn, &key)?;
        }

        Ok(petitioned_changed)
    }

    /// Records deletions with the current wall clock, keeping any existing
    /// record untouched. `original_timestamp` is the file's first admission
    /// time, preserved for undeletion. Returns how many records are new.
    pub fn record_delete_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        rows: &[(FileId, u64)],
    ) -> Result<u64> {
        let timestamp = unix_now();

        let mut num_new = 0;
        for &(file_id, original_timestamp) in rows {
            let key = PairKey::new(service_id, file_id);
            if self.deleted.get(wtxn, &key)?.is_none() {
                self.deleted.put(wtxn, &key, &DeletedRow { timestamp, original_timestamp })?;
                num_new += 1;
            }
        }

        Ok(num_new)
    }

    /// Forgets delete records on one service. Returns how many were cleared.
    pub fn clear_delete_record(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<u64> {
        let mut num_cleared = 0;
        for &file_id in file_ids {
            if self.deleted.delete(wtxn, &PairKey::new(service_id, file_id))? {
                num_cleared += 1;
            }
        }

        Ok(num_cleared)
    }

    /// Forgets local delete records everywhere, except for files sitting in
    /// the trash's current set, and cascades to the deletion reasons by the
    /// same rule. `file_ids` restricts the sweep when given. Returns how many
    /// records each service cleared.
    pub fn clear_local_delete_record(
        &self,
        wtxn: &mut RwTxn,
        file_ids: Option<&RoaringBitmap>,
    ) -> Result<HashMap<ServiceId, u64>> {
        let trash_service_id = self.services.trash();
        let mut nums_cleared = HashMap::new();

        match file_ids {
            None => {
                for service_id in self.services.local_non_trash() {
                    let mut to_clear = Vec::new();
                    let iter = self
                        .deleted
                        .remap_types::<PairPrefixCodec, DecodeIgnore>()
                        .prefix_iter(wtxn, &service_id)?
                        .remap_key_type::<PairKeyCodec>();
                    for result in iter {
                        let (key, ()) = result?;
                        to_clear.push(key.item);
                    }

                    let mut num_cleared = 0;
                    for file_id in to_clear {
                        let trash_key = PairKey::new(trash_service_id, file_id);
                        if self.current.get(wtxn, &trash_key)?.is_none() {
                            self.deleted.delete(wtxn, &PairKey::new(service_id, file_id))?;
                            num_cleared += 1;
                        }
                    }
                    nums_cleared.insert(service_id, num_cleared);
                }

                let mut reasons_to_clear = Vec::new();
                for result in self.deletion_reasons.iter(wtxn)? {
                    let (file_id, _) = result?;
                    reasons_to_clear.push(file_id);
                }
                for file_id in reasons_to_clear {
                    let trash_key = PairKey::new(trash_service_id, file_id);
                    if self.current.get(wtxn, &trash_key)?.is_none() {
                        self.deletion_reasons.delete(wtxn, &file_id)?;
                    }
                }
            }
            Some(file_ids) => {
                let trashed = self.filter_current_file_ids(wtxn, trash_service_id, file_ids)?;
                let ok_to_clear: Vec<FileId> = (file_ids - &trashed).iter().collect();

                if !ok_to_clear.is_empty() {
                    for service_id in self.services.local_non_trash() {
                        let num_cleared =
                            self.clear_delete_record(wtxn, service_id, &ok_to_clear)?;
                        nums_cleared.insert(service_id, num_cleared);
                    }
                    for &file_id in &ok_to_clear {
                        self.deletion_reasons.delete(wtxn, &file_id)?;
                    }
                }
            }
        }

        Ok(nums_cleared)
    }

    pub fn pend_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<()> {
        for &file_id in file_ids {
            self.pending.put(wtxn, &PairKey::new(service_id, file_id), &())?;
        }

        Ok(())
    }

    pub fn rescind_pend_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<()> {
        for &file_id in file_ids {
            self.pending.delete(wtxn, &PairKey::new(service_id, file_id))?;
        }

        Ok(())
    }

    /// Petitions files for removal, replacing any existing petition with the
    /// new reason.
    pub fn petition_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        reason_id: ReasonId,
        file_ids: &[FileId],
    ) -> Result<()> {
        for &file_id in file_ids {
            self.petitioned.put(wtxn, &PairKey::new(service_id, file_id), &reason_id)?;
        }

        Ok(())
    }

    pub fn rescind_petition_files(
        &self,
        wtxn: &mut RwTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<()> {
        for &file_id in file_ids {
            self.petitioned.delete(wtxn, &PairKey::new(service_id, file_id))?;
        }

        Ok(())
    }

    /// Clears everything pending or petitioned on a service.
    pub fn delete_pending(&self, wtxn: &mut RwTxn, service_id: ServiceId) -> Result<()> {
        self.delete_service_rows(wtxn, FileStatus::Pending, service_id)?;
        self.delete_service_rows(wtxn, FileStatus::Petitioned, service_id)?;

        Ok(())
    }

    /// Drops every state row of a retired service.
    pub fn remove_service(&self, wtxn: &mut RwTxn, service_id: ServiceId) -> Result<()> {
        for status in enum_iterator::all::<FileStatus>() {
            self.delete_service_rows(wtxn, status, service_id)?;
        }

        Ok(())
    }

    fn delete_service_rows(
        &self,
        wtxn: &mut RwTxn,
        status: FileStatus,
        service_id: ServiceId,
    ) -> Result<()> {
        let mut iter = self
            .raw(status)
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter_mut(wtxn, &service_id)?
            .remap_key_type::<DecodeIgnore>();

        while let Some(result) = iter.next() {
            result?;
            // safety: we don't hold any reference inside the database.
            unsafe { iter.del_current()? };
        }

        Ok(())
    }

    /// The rows needed to undelete files: which ones are recorded deleted and
    /// their original admission timestamps.
    pub fn get_undelete_rows(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<Vec<(FileId, u64)>> {
        let mut rows = Vec::new();
        for &file_id in file_ids {
            if let Some(row) = self.deleted.get(rtxn, &PairKey::new(service_id, file_id))? {
                rows.push((file_id, row.original_timestamp));
            }
        }

        Ok(rows)
    }

    pub fn current_files_count(&self, rtxn: &RoTxn, service_id: ServiceId) -> Result<u64> {
        self.status_count(rtxn, FileStatus::Current, service_id)
    }

    pub fn deleted_files_count(&self, rtxn: &RoTxn, service_id: ServiceId) -> Result<u64> {
        self.status_count(rtxn, FileStatus::Deleted, service_id)
    }

    pub fn pending_files_count(&self, rtxn: &RoTxn, service_id: ServiceId) -> Result<u64> {
        self.status_count(rtxn, FileStatus::Pending, service_id)
    }

    pub fn petitioned_files_count(&self, rtxn: &RoTxn, service_id: ServiceId) -> Result<u64> {
        self.status_count(rtxn, FileStatus::Petitioned, service_id)
    }

    /// How many rows the service owns in one state table.
    pub fn status_count(
        &self,
        rtxn: &RoTxn,
        status: FileStatus,
        service_id: ServiceId,
    ) -> Result<u64> {
        let iter = self
            .raw(status)
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter(rtxn, &service_id)?
            .remap_key_type::<DecodeIgnore>();

        let mut count = 0;
        for result in iter {
            result?;
            count += 1;
        }

        Ok(count)
    }

    /// Sum of the sizes of the service's current files, joined against the
    /// caller's file-info table.
    pub fn current_files_total_size(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_sizes: &heed::Database<BEU32, BEU64>,
    ) -> Result<u64> {
        let mut total_size = 0;
        for file_id in self.current_file_ids(rtxn, service_id)? {
            if let Some(size) = file_sizes.get(rtxn, &file_id)? {
                total_size += size;
            }
        }

        Ok(total_size)
    }

    /// How many of the service's current files sit in the caller's inbox set.
    pub fn current_files_inbox_count(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        inbox: &heed::Database<BEU32, Unit>,
    ) -> Result<u64> {
        let mut count = 0;
        for file_id in self.current_file_ids(rtxn, service_id)? {
            if inbox.get(rtxn, &file_id)?.is_some() {
                count += 1;
            }
        }

        Ok(count)
    }

    /// How many of the service's current files are also current locally.
    pub fn num_local(&self, rtxn: &RoTxn, service_id: ServiceId) -> Result<u64> {
        let local = self.current_file_ids(rtxn, self.services.combined_local_files())?;
        let current = self.current_file_ids(rtxn, service_id)?;

        Ok((current & local).len())
    }

    /// Every current file id of a service.
    pub fn current_file_ids(&self, rtxn: &RoTxn, service_id: ServiceId) -> Result<RoaringBitmap> {
        let mut file_ids = RoaringBitmap::new();
        let iter = self
            .current
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter(rtxn, &service_id)?
            .remap_key_type::<PairKeyCodec>();

        for result in iter {
            let (key, ()) = result?;
            file_ids.insert(key.item);
        }

        Ok(file_ids)
    }

    pub fn current_timestamp(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_id: FileId,
    ) -> Result<Option<u64>> {
        Ok(self.current.get(rtxn, &PairKey::new(service_id, file_id))?)
    }

    pub fn current_file_ids_to_timestamps(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_ids: &[FileId],
    ) -> Result<HashMap<FileId, u64>> {
        let mut timestamps = HashMap::new();
        for &file_id in file_ids {
            if let Some(timestamp) = self.current.get(rtxn, &PairKey::new(service_id, file_id))? {
                timestamps.insert(file_id, timestamp);
            }
        }

        Ok(timestamps)
    }

    /// The subset of `file_ids` current in the service. The combined sentinel
    /// contains everything, so it returns the input unchanged.
    pub fn filter_current_file_ids(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap> {
        self.filter_file_ids(rtxn, FileStatus::Current, service_id, file_ids)
    }

    /// The subset of `file_ids` pending on the service, with the same
    /// combined-sentinel rule as [`FileStore::filter_current_file_ids`].
    pub fn filter_pending_file_ids(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap> {
        self.filter_file_ids(rtxn, FileStatus::Pending, service_id, file_ids)
    }

    fn filter_file_ids(
        &self,
        rtxn: &RoTxn,
        status: FileStatus,
        service_id: ServiceId,
        file_ids: &RoaringBitmap,
    ) -> Result<RoaringBitmap> {
        if service_id == self.services.combined_files() {
            return Ok(file_ids.clone());
        }

        let db = self.raw(status);
        let mut found = RoaringBitmap::new();
        for file_id in file_ids {
            if db.get(rtxn, &PairKey::new(service_id, file_id))?.is_some() {
                found.insert(file_id);
            }
        }

        Ok(found)
    }

    /// The subset of `file_ids` current in any specific service, or in
    /// `just_these_service_ids` when given.
    pub fn filter_all_current_file_ids(
        &self,
        rtxn: &RoTxn,
        file_ids: &RoaringBitmap,
        just_these_service_ids: Option<&[ServiceId]>,
    ) -> Result<RoaringBitmap> {
        self.filter_all_file_ids(rtxn, FileStatus::Current, file_ids, just_these_service_ids)
    }

    /// The subset of `file_ids` pending on any specific service, or on
    /// `just_these_service_ids` when given.
    pub fn filter_all_pending_file_ids(
        &self,
        rtxn: &RoTxn,
        file_ids: &RoaringBitmap,
        just_these_service_ids: Option<&[ServiceId]>,
    ) -> Result<RoaringBitmap> {
        self.filter_all_file_ids(rtxn, FileStatus::Pending, file_ids, just_these_service_ids)
    }

    fn filter_all_file_ids(
        &self,
        rtxn: &RoTxn,
        status: FileStatus,
        file_ids: &RoaringBitmap,
        just_these_service_ids: Option<&[ServiceId]>,
    ) -> Result<RoaringBitmap> {
        let service_ids = match just_these_service_ids {
            Some(service_ids) => service_ids.to_vec(),
            None => self.services.specific(),
        };

        let mut found = RoaringBitmap::new();
        for service_id in service_ids {
            found |= self.filter_file_ids(rtxn, status, service_id, file_ids)?;
        }

        Ok(found)
    }

    /// Which specific services hold each file as current.
    pub fn file_ids_to_current_service_ids(
        &self,
        rtxn: &RoTxn,
        file_ids: &RoaringBitmap,
    ) -> Result<HashMap<FileId, Vec<ServiceId>>> {
        let mut current_service_ids: HashMap<FileId, Vec<ServiceId>> = HashMap::new();
        for service_id in self.services.specific() {
            for file_id in self.filter_current_file_ids(rtxn, service_id, file_ids)? {
                current_service_ids.entry(file_id).or_default().push(service_id);
            }
        }

        Ok(current_service_ids)
    }

    /// How many of `file_ids` each specific service holds as current.
    pub fn service_id_counts(
        &self,
        rtxn: &RoTxn,
        file_ids: &RoaringBitmap,
    ) -> Result<HashMap<ServiceId, u64>> {
        let mut counts = HashMap::new();
        for service_id in self.services.specific() {
            let found = self.filter_current_file_ids(rtxn, service_id, file_ids)?;
            counts.insert(service_id, found.len());
        }

        Ok(counts)
    }

    /// Any one pending file of the service, if there is one.
    pub fn a_pending_file_id(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
    ) -> Result<Option<FileId>> {
        self.a_file_id(rtxn, FileStatus::Pending, service_id)
    }

    /// Any one petitioned file of the service, if there is one.
    pub fn a_petitioned_file_id(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
    ) -> Result<Option<FileId>> {
        self.a_file_id(rtxn, FileStatus::Petitioned, service_id)
    }

    fn a_file_id(
        &self,
        rtxn: &RoTxn,
        status: FileStatus,
        service_id: ServiceId,
    ) -> Result<Option<FileId>> {
        let mut iter = self
            .raw(status)
            .remap_types::<PairPrefixCodec, DecodeIgnore>()
            .prefix_iter(rtxn, &service_id)?
            .remap_key_type::<PairKeyCodec>();

        match iter.next().transpose()? {
            Some((key, ())) => Ok(Some(key.item)),
            None => Ok(None),
        }
    }

    /// A bounded batch of the service's petitions, grouped by reason in
    /// ascending reason order.
    pub fn some_petitioned_rows(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        limit: usize,
    ) -> Result<Vec<(ReasonId, Vec<FileId>)>> {
        let mut rows = Vec::new();
        let iter = self
            .petitioned
            .remap_key_type::<PairPrefixCodec>()
            .prefix_iter(rtxn, &service_id)?
            .remap_key_type::<PairKeyCodec>();
        for result in iter {
            let (key, reason_id) = result?;
            rows.push((reason_id, key.item));
        }

        rows.sort_unstable();
        rows.truncate(limit);

        let mut grouped: Vec<(ReasonId, Vec<FileId>)> = Vec::new();
        for (reason_id, file_id) in rows {
            match grouped.last_mut() {
                Some((last_reason, file_ids)) if *last_reason == reason_id => {
                    file_ids.push(file_id);
                }
                _ => grouped.push((reason_id, vec![file_id])),
            }
        }

        Ok(grouped)
    }

    /// Whether the file is recorded deleted on the service, when, and the
    /// recorded local deletion reason if any. The reason can be set while the
    /// file merely sits in the trash, so it is reported either way.
    pub fn deletion_status(
        &self,
        rtxn: &RoTxn,
        service_id: ServiceId,
        file_id: FileId,
    ) -> Result<(bool, Option<u64>, Option<ReasonId>)> {
        let reason_id = self.deletion_reasons.get(rtxn, &file_id)?;

        match self.deleted.get(rtxn, &PairKey::new(service_id, file_id))? {
            Some(row) => Ok((true, Some(row.timestamp), reason_id)),
            None => Ok((false, None, reason_id)),
        }
    }

    /// Records why files were locally deleted, replacing any previous reason.
    pub fn set_file_deletion_reason(
        &self,
        wtxn: &mut RwTxn,
        file_ids: &[FileId],
        reason_id: ReasonId,
    ) -> Result<()> {
        for &file_id in file_ids {
            self.deletion_reasons.put(wtxn, &file_id, &reason_id)?;
        }

        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |duration| duration.as_secs())
}
