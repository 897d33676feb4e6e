//! Sparse storage for point tracks.
//!
//! The store is a sparse matrix whose columns are frames and whose rows
//! are tracks. Each frame keeps its points in a [`BucketGrid`] for local
//! search, and each point links to its match on the previous and next
//! frame. A chain of matched points is a [`Track`], which carries
//! user data updated through [`TrackHooks`] as points join and leave it.
//!
//! Points, frames and tracks live in slot maps and refer to each other by
//! key, so removal never leaves dangling links.

use std::collections::VecDeque;

use slotmap::{new_key_type, SlotMap};

use crate::tracks::bucket_grid::BucketGrid;

new_key_type! {
    pub struct KeypointId;
    pub struct FrameId;
    pub struct TrackId;
}

#[derive(Clone, Debug)]
pub struct TrackPoint<K> {
    pub u: f32,
    pub v: f32,
    pub data: K,
    frame: FrameId,
    track: Option<TrackId>,
    prev: Option<KeypointId>,
    next: Option<KeypointId>,
}

impl<K> TrackPoint<K> {
    pub fn frame(&self) -> FrameId {
        self.frame
    }

    pub fn track(&self) -> Option<TrackId> {
        self.track
    }

    /// Matching point on the previous frame.
    pub fn prev(&self) -> Option<KeypointId> {
        self.prev
    }

    /// Matching point on the next frame.
    pub fn next(&self) -> Option<KeypointId> {
        self.next
    }
}

#[derive(Clone, Debug)]
pub struct TrackFrame<F> {
    pub data: F,
    points: BucketGrid<KeypointId>,
}

impl<F> TrackFrame<F> {
    pub fn points(&self) -> &BucketGrid<KeypointId> {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Track<T> {
    pub data: T,
    head: KeypointId,
    length: usize,
}

impl<T> Track<T> {
    /// Most recent point of the track. Its `next` is always `None`.
    pub fn head(&self) -> KeypointId {
        self.head
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

/// Callbacks fired when a point joins or leaves a track.
pub trait TrackHooks<K, T> {
    fn point_added(&mut self, _track: &mut T, _point: &mut K) {}

    fn point_removed(&mut self, _track: &mut T, _point: &mut K) {}
}

pub struct NoHooks;

impl<K, T> TrackHooks<K, T> for NoHooks {}

pub struct TrackStore<K, F, T> {
    points: SlotMap<KeypointId, TrackPoint<K>>,
    frames: SlotMap<FrameId, TrackFrame<F>>,
    tracks: SlotMap<TrackId, Track<T>>,
    /// Newest frame first.
    order: VecDeque<FrameId>,
    bucket_bits: u32,
}

impl<K, F, T: Default> TrackStore<K, F, T> {
    pub fn new(bucket_bits: u32) -> Self {
        Self {
            points: SlotMap::with_key(),
            frames: SlotMap::with_key(),
            tracks: SlotMap::with_key(),
            order: VecDeque::new(),
            bucket_bits,
        }
    }

    /// Appends a frame as the newest one.
    pub fn add_frame(&mut self, width: u32, height: u32, data: F) -> FrameId {
        let id = self.frames.insert(TrackFrame {
            data,
            points: BucketGrid::new(width, height, self.bucket_bits),
        });
        self.order.push_front(id);
        id
    }

    /// # Panics
    /// If `frame` is not in the store.
    pub fn add_point(&mut self, frame: FrameId, u: f32, v: f32, data: K) -> KeypointId {
        assert!(self.frames.contains_key(frame), "unknown frame");
        let id = self.points.insert(TrackPoint {
            u,
            v,
            data,
            frame,
            track: None,
            prev: None,
            next: None,
        });
        self.frames[frame].points.insert(id, u, v);
        id
    }

    pub fn point(&self, id: KeypointId) -> Option<&TrackPoint<K>> {
        self.points.get(id)
    }

    pub fn point_mut(&mut self, id: KeypointId) -> Option<&mut TrackPoint<K>> {
        self.points.get_mut(id)
    }

    pub fn frame(&self, id: FrameId) -> Option<&TrackFrame<F>> {
        self.frames.get(id)
    }

    pub fn frame_mut(&mut self, id: FrameId) -> Option<&mut TrackFrame<F>> {
        self.frames.get_mut(id)
    }

    pub fn track(&self, id: TrackId) -> Option<&Track<T>> {
        self.tracks.get(id)
    }

    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track<T>> {
        self.tracks.get_mut(id)
    }

    /// Disjoint mutable access to a point's data and its track's data.
    pub fn point_and_track_mut(&mut self, id: KeypointId) -> Option<(&mut K, Option<&mut T>)> {
        let point = self.points.get_mut(id)?;
        let track = point.track.and_then(|t| self.tracks.get_mut(t)).map(|t| &mut t.data);
        Some((&mut point.data, track))
    }

    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    pub fn frame_count(&self) -> usize {
        self.order.len()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn tracks(&self) -> impl Iterator<Item = (TrackId, &Track<T>)> {
        self.tracks.iter()
    }

    /// Frame ids, newest first.
    pub fn frame_ids(&self) -> impl Iterator<Item = FrameId> + '_ {
        self.order.iter().copied()
    }

    /// The `n`th most recent frame; 0 is the newest.
    pub fn get_nth_frame(&self, n: usize) -> Option<FrameId> {
        self.order.get(n).copied()
    }

    /// Snapshot of the points of `frame`.
    pub fn points_in(&self, frame: FrameId) -> Vec<KeypointId> {
        self.frames
            .get(frame)
            .map(|f| f.points.keys())
            .unwrap_or_default()
    }

    /// Points of `frame` in the buckets around `(u, v)`; see [`BucketGrid::search`].
    pub fn search(&self, frame: FrameId, u: f32, v: f32, radius: f32) -> Vec<KeypointId> {
        self.frames
            .get(frame)
            .map(|f| f.points.search(u, v, radius))
            .unwrap_or_default()
    }

    pub fn closest_point(&self, frame: FrameId, u: f32, v: f32, radius: f32) -> Option<KeypointId> {
        self.frames
            .get(frame)?
            .points
            .closest_point(u, v, radius)
            .map(|(k, _)| k)
    }

    /// True if a point of `frame` lies strictly inside the circle.
    pub fn has_point_in(&self, frame: FrameId, u: f32, v: f32, radius: f32) -> bool {
        let r2 = radius * radius;
        self.search(frame, u, v, radius).into_iter().any(|k| {
            let p = &self.points[k];
            let (du, dv) = (u - p.u, v - p.v);
            du * du + dv * dv < r2
        })
    }

    /// Number of matched predecessors of `id`.
    pub fn track_length(&self, id: KeypointId) -> usize {
        let mut length = 0;
        let mut cursor = self.points.get(id).and_then(|p| p.prev);
        while let Some(k) = cursor {
            length += 1;
            cursor = self.points[k].prev;
        }
        length
    }

    /// True if the point's track holds at least `length` points.
    pub fn track_is_longer(&self, id: KeypointId, length: usize) -> bool {
        match self.points.get(id).and_then(|p| p.track) {
            Some(t) => self.tracks.get(t).is_some_and(|t| t.length >= length),
            None => length == 0,
        }
    }

    /// Points of the track ending at `id`, newest first.
    pub fn chain(&self, id: KeypointId) -> Vec<KeypointId> {
        let mut points = Vec::new();
        let mut cursor = self.points.get(id).map(|_| id);
        while let Some(k) = cursor {
            points.push(k);
            cursor = self.points[k].prev;
        }
        points
    }

    /// Links `prev` to `next`, extending the track of `prev` or starting a new one.
    ///
    /// # Panics
    /// If `prev` already has a successor, or `next` already has a
    /// predecessor or a track.
    pub fn set_match<H>(&mut self, prev: KeypointId, next: KeypointId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        assert!(self.points[prev].next.is_none(), "point already has a successor");
        assert!(self.points[next].prev.is_none(), "point already has a predecessor");
        assert!(self.points[next].track.is_none(), "point already belongs to a track");

        self.points[prev].next = Some(next);
        self.points[next].prev = Some(prev);
        let track = match self.points[prev].track {
            Some(t) => {
                self.tracks[t].head = next;
                t
            }
            None => {
                let t = self.tracks.insert(Track {
                    data: T::default(),
                    head: next,
                    length: 0,
                });
                self.points[prev].track = Some(t);
                self.fire_added(t, prev, hooks);
                t
            }
        };
        self.points[next].track = Some(track);
        self.fire_added(track, next, hooks);
    }

    /// Cuts `id` from its predecessor and from its track.
    ///
    /// # Panics
    /// If `id` has no predecessor or no track.
    pub fn unset_match<H>(&mut self, id: KeypointId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        assert!(self.points[id].prev.is_some(), "point has no predecessor");
        let track = self.points[id].track;
        assert!(track.is_some(), "point has no track");
        self.leave_track(id, track, hooks);
    }

    /// Removes `id` from its frame and track, then forgets it.
    pub fn dispose<H>(&mut self, id: KeypointId, hooks: &mut H) -> Option<K>
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        let point = self.points.get(id)?;
        let (frame, track) = (point.frame, point.track);
        if let Some(f) = self.frames.get_mut(frame) {
            f.points.remove(id);
        }
        self.leave_track(id, track, hooks);
        self.points.remove(id).map(|p| p.data)
    }

    fn leave_track<H>(&mut self, id: KeypointId, track: Option<TrackId>, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        if let Some(t) = track {
            self.fire_removed(t, id, hooks);
        }
        let (prev, next) = (self.points[id].prev, self.points[id].next);
        let mut emptied = false;
        if let Some(t) = track {
            let tr = &mut self.tracks[t];
            if tr.head == id {
                match prev {
                    Some(p) => tr.head = p,
                    None => emptied = true,
                }
            }
        }
        if let Some(p) = prev {
            self.points[p].next = next;
        }
        if let Some(n) = next {
            self.points[n].prev = prev;
        }
        let point = &mut self.points[id];
        point.prev = None;
        point.next = None;
        point.track = None;
        if let (true, Some(t)) = (emptied, track) {
            self.tracks.remove(t);
        }
    }

    fn fire_added<H>(&mut self, track: TrackId, point: KeypointId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        let t = &mut self.tracks[track];
        t.length += 1;
        hooks.point_added(&mut t.data, &mut self.points[point].data);
    }

    fn fire_removed<H>(&mut self, track: TrackId, point: KeypointId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        let t = &mut self.tracks[track];
        t.length = t.length.saturating_sub(1);
        hooks.point_removed(&mut t.data, &mut self.points[point].data);
    }

    /// Disposes `id` and every point it is chained to, forward then backward.
    pub fn remove_point_track<H>(&mut self, id: KeypointId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        let Some(point) = self.points.get(id) else {
            return;
        };
        let mut backward = point.prev;
        let mut forward = Some(id);
        while let Some(k) = forward {
            forward = self.points[k].next;
            self.dispose(k, hooks);
        }
        while let Some(k) = backward {
            backward = self.points[k].prev;
            self.dispose(k, hooks);
        }
    }

    /// Disposes `id` and then everything still chained to its predecessor.
    pub fn remove_track_tail<H>(&mut self, id: KeypointId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        let Some(point) = self.points.get(id) else {
            return;
        };
        let prev = point.prev;
        self.dispose(id, hooks);
        if let Some(p) = prev {
            self.remove_point_track(p, hooks);
        }
    }

    /// Removes every track whose last point lies in `frame`, then every
    /// frame left without points.
    pub fn remove_unmatched_tracks<H>(&mut self, frame: FrameId, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        for k in self.points_in(frame) {
            if self.points.get(k).is_some_and(|p| p.next.is_none()) {
                self.remove_point_track(k, hooks);
            }
        }
        self.remove_empty_frames();
    }

    /// Returns how many frames were removed.
    pub fn remove_empty_frames(&mut self) -> usize {
        let before = self.order.len();
        let frames = &mut self.frames;
        self.order.retain(|f| {
            let empty = frames.get(*f).map_or(true, |fr| fr.points.is_empty());
            if empty {
                frames.remove(*f);
            }
            !empty
        });
        before - self.order.len()
    }

    /// Removes `frame` and the tails of every track passing through it.
    pub fn remove_frame<H>(&mut self, frame: FrameId, hooks: &mut H) -> Option<F>
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        for k in self.points_in(frame) {
            self.remove_track_tail(k, hooks);
        }
        self.order.retain(|f| *f != frame);
        self.frames.remove(frame).map(|f| f.data)
    }

    /// Prunes tracks that ended `depth` frames ago.
    pub fn prune_history<H>(&mut self, depth: usize, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        if let Some(frame) = self.get_nth_frame(depth) {
            self.remove_unmatched_tracks(frame, hooks);
        }
    }

    /// Removes every frame, point and track.
    pub fn clear<H>(&mut self, hooks: &mut H)
    where
        H: TrackHooks<K, T> + ?Sized,
    {
        while let Some(newest) = self.get_nth_frame(0) {
            self.remove_unmatched_tracks(newest, hooks);
        }
    }
}
