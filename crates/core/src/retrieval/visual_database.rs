//! Visual objects indexed by their visual-word histograms.
//!
//! Every object is a cluster of the owned [`ClusterCollection`], and its
//! keypoints, representative image and annotations are persisted in four
//! tables of a [`TableStore`]. Opening a database reloads and indexes every
//! stored object.

use std::collections::{BTreeMap, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::retrieval::cluster_collection::{ClusterCollection, ClusterKey};
use crate::retrieval::histogram::Histogram;
use crate::retrieval::query_rules::QueryRules;
use crate::shared::constants::{ANNOTATIONS_TABLE, IMAGES_TABLE, KEYPOINTS_TABLE, OBJECTS_TABLE};
use crate::shared::frame::Frame;
use crate::storage::domain::table_store::{Row, RowId, StoreError, TableStore, Value, ROWID_COLUMN};

/// Row id of an object in the objects table.
pub type ObjectId = RowId;

const IMAGE_COLUMNS: [&str; 5] = ["width", "height", "step", "channels", "data"];
const OBJECT_COLUMNS: [&str; 3] = ["timestamp", "comment", "flags"];
const KEYPOINT_COLUMNS: [&str; 8] = [
    "obj_id", "cid", "img_id", "u", "v", "scale", "orient", "patch",
];
const ANNOTATION_COLUMNS: [&str; 5] = ["obj", "x", "y", "type", "descr"];

#[derive(Error, Debug)]
pub enum VisualDatabaseError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no visual object with id {0}")]
    UnknownObject(ObjectId),
    #[error("malformed row {rowid} in table {table}")]
    MalformedRow { table: &'static str, rowid: RowId },
}

/// Geometric check an object requires before it counts as detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct VerifyFlags(u8);

impl VerifyFlags {
    pub const NONE: VerifyFlags = VerifyFlags(0);
    pub const HOMOGRAPHY: VerifyFlags = VerifyFlags(1);
    pub const FMAT: VerifyFlags = VerifyFlags(2);

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & 3)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn homography(self) -> bool {
        self.0 & Self::HOMOGRAPHY.0 != 0
    }

    pub fn fmat(self) -> bool {
        self.0 & Self::FMAT.0 != 0
    }

    pub fn needs_verification(self) -> bool {
        self.0 != 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DbKeypoint {
    pub word: u32,
    pub image: Option<RowId>,
    pub u: f32,
    pub v: f32,
    pub scale: f32,
    pub orientation: f32,
    pub descriptor: Vec<f32>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    pub rowid: RowId,
    pub x: f32,
    pub y: f32,
    pub kind: i64,
    pub description: String,
}

#[derive(Clone, Debug)]
enum IndexState {
    Pending(Histogram),
    Indexed(ClusterKey),
}

#[derive(Clone, Debug)]
pub struct VisualObject {
    id: ObjectId,
    timestamp: i64,
    comment: String,
    flags: VerifyFlags,
    keypoints: BTreeMap<u32, Vec<DbKeypoint>>,
    keypoint_count: usize,
    representative_image: Option<RowId>,
    annotations: Vec<Annotation>,
    state: IndexState,
}

impl VisualObject {
    fn new(id: ObjectId, timestamp: i64, comment: String, flags: VerifyFlags) -> Self {
        Self {
            id,
            timestamp,
            comment,
            flags,
            keypoints: BTreeMap::new(),
            keypoint_count: 0,
            representative_image: None,
            annotations: Vec::new(),
            state: IndexState::Pending(Histogram::new()),
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Creation time in seconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn comment(&self) -> &str {
        &self.comment
    }

    pub fn flags(&self) -> VerifyFlags {
        self.flags
    }

    pub fn keypoint_count(&self) -> usize {
        self.keypoint_count
    }

    /// Keypoints quantized to `word`.
    pub fn find_keypoints(&self, word: u32) -> &[DbKeypoint] {
        self.keypoints.get(&word).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keypoints(&self) -> impl Iterator<Item = &DbKeypoint> {
        self.keypoints.values().flatten()
    }

    pub fn representative_image(&self) -> Option<RowId> {
        self.representative_image
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    /// Cluster holding this object's histogram, once indexed.
    pub fn cluster_key(&self) -> Option<ClusterKey> {
        match self.state {
            IndexState::Indexed(key) => Some(key),
            IndexState::Pending(_) => None,
        }
    }

    fn push(&mut self, keypoint: DbKeypoint) {
        self.keypoints.entry(keypoint.word).or_default().push(keypoint);
        self.keypoint_count += 1;
    }
}

pub struct VisualDatabase {
    clusters: ClusterCollection,
    store: Box<dyn TableStore>,
    objects: BTreeMap<ObjectId, VisualObject>,
    by_cluster: HashMap<ClusterKey, ObjectId>,
    images: HashMap<RowId, Frame>,
}

impl VisualDatabase {
    /// Creates the tables when missing, then loads and indexes every stored object.
    pub fn open(mut store: Box<dyn TableStore>, rules: QueryRules) -> Result<Self, VisualDatabaseError> {
        store.ensure_table(IMAGES_TABLE, &IMAGE_COLUMNS)?;
        store.ensure_table(OBJECTS_TABLE, &OBJECT_COLUMNS)?;
        store.ensure_table(KEYPOINTS_TABLE, &KEYPOINT_COLUMNS)?;
        store.ensure_table(ANNOTATIONS_TABLE, &ANNOTATION_COLUMNS)?;

        let mut objects = BTreeMap::new();
        for (rowid, row) in store.rows(OBJECTS_TABLE)? {
            let object = VisualObject::new(
                rowid,
                integer(row, 0, OBJECTS_TABLE, rowid)?,
                text(row, 1, OBJECTS_TABLE, rowid)?,
                VerifyFlags::from_bits(integer(row, 2, OBJECTS_TABLE, rowid)? as u8),
            );
            objects.insert(rowid, object);
        }
        for (rowid, row) in store.rows(KEYPOINTS_TABLE)? {
            let owner = integer(row, 0, KEYPOINTS_TABLE, rowid)?;
            let Some(object) = objects.get_mut(&owner) else {
                log::warn!("Keypoint {rowid} belongs to missing object {owner}");
                continue;
            };
            let keypoint = decode_keypoint(row, rowid)?;
            if keypoint.image.is_some() {
                object.representative_image = keypoint.image;
            }
            if let IndexState::Pending(histogram) = &mut object.state {
                histogram.add(keypoint.word, 1);
            }
            object.push(keypoint);
        }
        for (rowid, row) in store.rows(ANNOTATIONS_TABLE)? {
            let owner = integer(row, 0, ANNOTATIONS_TABLE, rowid)?;
            if let Some(object) = objects.get_mut(&owner) {
                object.annotations.push(Annotation {
                    rowid,
                    x: real(row, 1, ANNOTATIONS_TABLE, rowid)? as f32,
                    y: real(row, 2, ANNOTATIONS_TABLE, rowid)? as f32,
                    kind: integer(row, 3, ANNOTATIONS_TABLE, rowid)?,
                    description: text(row, 4, ANNOTATIONS_TABLE, rowid)?,
                });
            }
        }

        let mut db = Self {
            clusters: ClusterCollection::new(rules),
            store,
            objects,
            by_cluster: HashMap::new(),
            images: HashMap::new(),
        };
        let ids: Vec<ObjectId> = db.objects.keys().copied().collect();
        for id in ids {
            db.add_to_index(id)?;
        }
        log::info!(
            "Opened visual database with {} objects ({} clusters)",
            db.objects.len(),
            db.clusters.len()
        );
        Ok(db)
    }

    pub fn clusters(&self) -> &ClusterCollection {
        &self.clusters
    }

    pub fn clusters_mut(&mut self) -> &mut ClusterCollection {
        &mut self.clusters
    }

    pub fn store(&self) -> &dyn TableStore {
        self.store.as_ref()
    }

    pub fn into_store(self) -> Box<dyn TableStore> {
        self.store
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn object(&self, id: ObjectId) -> Option<&VisualObject> {
        self.objects.get(&id)
    }

    pub fn objects(&self) -> impl Iterator<Item = &VisualObject> {
        self.objects.values()
    }

    pub fn object_for_cluster(&self, key: ClusterKey) -> Option<ObjectId> {
        self.by_cluster.get(&key).copied()
    }

    /// Opens a batch spanning several calls, closed by [`finish_update`](Self::finish_update).
    pub fn start_update(&mut self) -> Result<(), VisualDatabaseError> {
        self.store.begin()?;
        Ok(())
    }

    pub fn finish_update(&mut self) -> Result<(), VisualDatabaseError> {
        self.store.commit()?;
        Ok(())
    }

    pub fn create_object(&mut self, comment: &str, flags: VerifyFlags) -> Result<ObjectId, VisualDatabaseError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let id = self.store.insert(
            OBJECTS_TABLE,
            vec![timestamp.into(), comment.into(), Value::Integer(flags.bits() as i64)],
        )?;
        self.objects
            .insert(id, VisualObject::new(id, timestamp, comment.to_string(), flags));
        log::debug!("Created visual object {id}");
        Ok(id)
    }

    /// Moves a new object's histogram into the cluster collection.
    /// Returns the object's cluster key.
    pub fn add_to_index(&mut self, id: ObjectId) -> Result<ClusterKey, VisualDatabaseError> {
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(VisualDatabaseError::UnknownObject(id))?;
        let key = match &mut object.state {
            IndexState::Indexed(key) => *key,
            IndexState::Pending(histogram) => {
                let key = self.clusters.add_cluster(std::mem::take(histogram));
                object.state = IndexState::Indexed(key);
                self.by_cluster.insert(key, id);
                key
            }
        };
        Ok(key)
    }

    /// Stores one keypoint of object `id`. Keypoints without a word are
    /// ignored and `false` is returned.
    pub fn add_keypoint(&mut self, id: ObjectId, keypoint: DbKeypoint) -> Result<bool, VisualDatabaseError> {
        if keypoint.word == 0 {
            return Ok(false);
        }
        if !self.objects.contains_key(&id) {
            return Err(VisualDatabaseError::UnknownObject(id));
        }
        self.store.insert(KEYPOINTS_TABLE, encode_keypoint(id, &keypoint))?;
        self.attach(id, keypoint);
        Ok(true)
    }

    /// Stores keypoints of several objects in one batch. The returned flags
    /// follow `keypoints`; keypoints without a word are not stored. On error
    /// the batch is rolled back and no object changes.
    pub fn add_keypoints(
        &mut self,
        keypoints: Vec<(ObjectId, DbKeypoint)>,
    ) -> Result<Vec<bool>, VisualDatabaseError> {
        if let Some((id, _)) = keypoints.iter().find(|(id, _)| !self.objects.contains_key(id)) {
            return Err(VisualDatabaseError::UnknownObject(*id));
        }
        write_batch(self.store.as_mut(), |store| {
            for (id, keypoint) in keypoints.iter().filter(|(_, k)| k.word != 0) {
                store.insert(KEYPOINTS_TABLE, encode_keypoint(*id, keypoint))?;
            }
            Ok(())
        })?;

        let mut stored = Vec::with_capacity(keypoints.len());
        for (id, keypoint) in keypoints {
            let kept = keypoint.word != 0;
            if kept {
                self.attach(id, keypoint);
            }
            stored.push(kept);
        }
        Ok(stored)
    }

    fn attach(&mut self, id: ObjectId, keypoint: DbKeypoint) {
        let Some(object) = self.objects.get_mut(&id) else {
            return;
        };
        match &mut object.state {
            IndexState::Pending(histogram) => {
                histogram.add(keypoint.word, 1);
            }
            IndexState::Indexed(key) => {
                self.clusters.update_cluster(*key, keypoint.word, 1);
            }
        }
        object.push(keypoint);
    }

    /// Stores `image` as the object's representative image along with
    /// every keypoint found on it, in one batch. Returns how many
    /// keypoints were kept.
    pub fn add_frame(
        &mut self,
        id: ObjectId,
        image: &Frame,
        keypoints: Vec<DbKeypoint>,
    ) -> Result<usize, VisualDatabaseError> {
        if !self.objects.contains_key(&id) {
            return Err(VisualDatabaseError::UnknownObject(id));
        }
        let kept: Vec<DbKeypoint> = keypoints.into_iter().filter(|k| k.word != 0).collect();
        let (image_id, kept) = write_batch(self.store.as_mut(), |store| {
            let image_id = store.insert(IMAGES_TABLE, encode_image(image))?;
            let mut stored = Vec::with_capacity(kept.len());
            for mut keypoint in kept {
                keypoint.image = Some(image_id);
                store.insert(KEYPOINTS_TABLE, encode_keypoint(id, &keypoint))?;
                stored.push(keypoint);
            }
            Ok((image_id, stored))
        })?;

        let count = kept.len();
        self.images.insert(image_id, image.clone());
        if let Some(object) = self.objects.get_mut(&id) {
            object.representative_image = Some(image_id);
        }
        for keypoint in kept {
            self.attach(id, keypoint);
        }
        log::debug!("Added {count} keypoints and image {image_id} to object {id}");
        Ok(count)
    }

    /// Deletes the object's rows, then drops its cluster from the index.
    /// Returns `false` if no such object exists.
    pub fn remove_object(&mut self, id: ObjectId) -> Result<bool, VisualDatabaseError> {
        let Some(object) = self.objects.get(&id) else {
            return Ok(false);
        };
        let image = object.representative_image;
        write_batch(self.store.as_mut(), |store| {
            store.delete_where(OBJECTS_TABLE, ROWID_COLUMN, &Value::Integer(id))?;
            store.delete_where(KEYPOINTS_TABLE, "obj_id", &Value::Integer(id))?;
            store.delete_where(ANNOTATIONS_TABLE, "obj", &Value::Integer(id))?;
            if let Some(image) = image {
                store.delete_where(IMAGES_TABLE, ROWID_COLUMN, &Value::Integer(image))?;
            }
            Ok(())
        })?;

        if let Some(object) = self.objects.remove(&id) {
            if let Some(key) = object.cluster_key() {
                self.clusters.remove_cluster(key);
                self.by_cluster.remove(&key);
            }
        }
        if let Some(image) = image {
            self.images.remove(&image);
        }
        log::info!("Removed visual object {id}");
        Ok(true)
    }

    pub fn add_image(&mut self, image: &Frame) -> Result<RowId, VisualDatabaseError> {
        let id = self.store.insert(IMAGES_TABLE, encode_image(image))?;
        self.images.insert(id, image.clone());
        Ok(id)
    }

    /// Image `id`, read from the store on first access and cached.
    pub fn get_image(&mut self, id: RowId) -> Result<Option<&Frame>, VisualDatabaseError> {
        if !self.images.contains_key(&id) {
            let found = self
                .store
                .rows(IMAGES_TABLE)?
                .find(|(rowid, _)| *rowid == id)
                .map(|(rowid, row)| decode_image(row, rowid))
                .transpose()?;
            match found {
                Some(frame) => {
                    self.images.insert(id, frame);
                }
                None => {
                    log::warn!("Image {id} not found");
                    return Ok(None);
                }
            }
        }
        Ok(self.images.get(&id))
    }

    pub fn add_annotation(
        &mut self,
        id: ObjectId,
        x: f32,
        y: f32,
        kind: i64,
        description: &str,
    ) -> Result<RowId, VisualDatabaseError> {
        if !self.objects.contains_key(&id) {
            return Err(VisualDatabaseError::UnknownObject(id));
        }
        let rowid = self.store.insert(
            ANNOTATIONS_TABLE,
            vec![
                Value::Integer(id),
                x.into(),
                y.into(),
                Value::Integer(kind),
                description.into(),
            ],
        )?;
        if let Some(object) = self.objects.get_mut(&id) {
            object.annotations.push(Annotation {
                rowid,
                x,
                y,
                kind,
                description: description.to_string(),
            });
        }
        Ok(rowid)
    }

    /// Best object for a bag of words, with its score.
    pub fn query_words<I>(&mut self, words: I) -> Option<(ObjectId, f64)>
    where
        I: IntoIterator<Item = u32>,
    {
        let query: Histogram = words.into_iter().filter(|w| *w != 0).collect();
        let (key, score) = self.clusters.get_best_cluster(&query)?;
        self.object_for_cluster(key).map(|id| (id, score))
    }
}

fn write_batch<R>(
    store: &mut dyn TableStore,
    write: impl FnOnce(&mut dyn TableStore) -> Result<R, VisualDatabaseError>,
) -> Result<R, VisualDatabaseError> {
    if store.in_batch() {
        return write(store);
    }
    store.begin()?;
    match write(store) {
        Ok(result) => {
            store.commit()?;
            Ok(result)
        }
        Err(e) => {
            store.rollback()?;
            Err(e)
        }
    }
}

fn encode_keypoint(object: ObjectId, k: &DbKeypoint) -> Row {
    let patch: Vec<u8> = k.descriptor.iter().flat_map(|x| x.to_le_bytes()).collect();
    vec![
        Value::Integer(object),
        k.word.into(),
        k.image.map_or(Value::Null, Value::Integer),
        k.u.into(),
        k.v.into(),
        k.scale.into(),
        k.orientation.into(),
        patch.into(),
    ]
}

fn decode_keypoint(row: &Row, rowid: RowId) -> Result<DbKeypoint, VisualDatabaseError> {
    let t = KEYPOINTS_TABLE;
    let word = u32::try_from(integer(row, 1, t, rowid)?)
        .map_err(|_| VisualDatabaseError::MalformedRow { table: t, rowid })?;
    let patch = blob(row, 7, t, rowid)?;
    if patch.len() % 4 != 0 {
        return Err(VisualDatabaseError::MalformedRow { table: t, rowid });
    }
    Ok(DbKeypoint {
        word,
        image: row.get(2).and_then(Value::as_integer),
        u: real(row, 3, t, rowid)? as f32,
        v: real(row, 4, t, rowid)? as f32,
        scale: real(row, 5, t, rowid)? as f32,
        orientation: real(row, 6, t, rowid)? as f32,
        descriptor: patch
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    })
}

fn encode_image(image: &Frame) -> Row {
    let step = image.width() as i64 * image.channels() as i64;
    vec![
        image.width().into(),
        image.height().into(),
        Value::Integer(step),
        Value::Integer(image.channels() as i64),
        image.data().to_vec().into(),
    ]
}

fn decode_image(row: &Row, rowid: RowId) -> Result<Frame, VisualDatabaseError> {
    let t = IMAGES_TABLE;
    let malformed = VisualDatabaseError::MalformedRow { table: t, rowid };
    let width = integer(row, 0, t, rowid)?;
    let height = integer(row, 1, t, rowid)?;
    let step = integer(row, 2, t, rowid)?;
    let channels = integer(row, 3, t, rowid)?;
    let data = blob(row, 4, t, rowid)?;
    if width <= 0 || height <= 0 || !(1..=4).contains(&channels) || step < width * channels {
        return Err(malformed);
    }
    if data.len() as i64 != step * height {
        return Err(malformed);
    }
    let packed = (width * channels) as usize;
    let pixels: Vec<u8> = data
        .chunks_exact(step as usize)
        .flat_map(|line| line[..packed].iter().copied())
        .collect();
    Ok(Frame::new(pixels, width as u32, height as u32, channels as u8, 0))
}

fn integer(row: &Row, col: usize, table: &'static str, rowid: RowId) -> Result<i64, VisualDatabaseError> {
    row.get(col)
        .and_then(Value::as_integer)
        .ok_or(VisualDatabaseError::MalformedRow { table, rowid })
}

fn real(row: &Row, col: usize, table: &'static str, rowid: RowId) -> Result<f64, VisualDatabaseError> {
    row.get(col)
        .and_then(Value::as_real)
        .ok_or(VisualDatabaseError::MalformedRow { table, rowid })
}

fn text(row: &Row, col: usize, table: &'static str, rowid: RowId) -> Result<String, VisualDatabaseError> {
    match row.get(col) {
        Some(Value::Null) => Ok(String::new()),
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(VisualDatabaseError::MalformedRow { table, rowid }),
    }
}

fn blob<'a>(row: &'a Row, col: usize, table: &'static str, rowid: RowId) -> Result<&'a [u8], VisualDatabaseError> {
    row.get(col)
        .and_then(Value::as_blob)
        .ok_or(VisualDatabaseError::MalformedRow { table, rowid })
}
