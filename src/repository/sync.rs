// Write plan for a media item tree. Every node's operation is decided up front,
// so the plan can be inspected before anything touches the database.

use crate::error::{Error, Result};
use crate::models::{MediaItem, MediaItemTree, TvEpisode, TvSeason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Create,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOp {
    /// New row; an explicit id is kept when the caller supplied one
    Insert { id: Option<i64> },
    Update(i64),
}

impl NodeOp {
    fn decide(id: Option<i64>, mode: SyncMode) -> Self {
        match (mode, id) {
            (SyncMode::Update, Some(id)) => NodeOp::Update(id),
            (_, id) => NodeOp::Insert { id },
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, NodeOp::Insert { .. })
    }
}

#[derive(Debug, Clone)]
pub struct EpisodePlan {
    pub op: NodeOp,
    pub episode: TvEpisode,
}

#[derive(Debug, Clone)]
pub struct SeasonPlan {
    pub op: NodeOp,
    pub season: TvSeason,
    pub episodes: Vec<EpisodePlan>,
}

#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub mode: SyncMode,
    pub op: NodeOp,
    pub item: MediaItem,
    pub seasons: Vec<SeasonPlan>,
}

impl SyncPlan {
    pub fn build(tree: &MediaItemTree, mode: SyncMode) -> Result<Self> {
        let op = match mode {
            SyncMode::Create => NodeOp::Insert { id: tree.item.id },
            SyncMode::Update => NodeOp::Update(tree.item.id.ok_or_else(|| {
                Error::validation(format!(
                    "cannot update \"{}\": media item has no id",
                    tree.item.title
                ))
            })?),
        };

        let seasons = tree
            .seasons
            .iter()
            .map(|season| SeasonPlan {
                op: NodeOp::decide(season.season.id, mode),
                season: season.season.clone(),
                episodes: season
                    .episodes
                    .iter()
                    .map(|episode| EpisodePlan {
                        op: NodeOp::decide(episode.id, mode),
                        episode: episode.clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(Self {
            mode,
            op,
            item: tree.item.clone(),
            seasons,
        })
    }

    fn ops(&self) -> impl Iterator<Item = &NodeOp> {
        std::iter::once(&self.op).chain(
            self.seasons
                .iter()
                .flat_map(|s| std::iter::once(&s.op).chain(s.episodes.iter().map(|e| &e.op))),
        )
    }

    /// Number of rows the plan will create
    pub fn inserts(&self) -> usize {
        self.ops().filter(|op| op.is_insert()).count()
    }

    /// Number of rows the plan will overwrite in place
    pub fn updates(&self) -> usize {
        self.ops().filter(|op| !op.is_insert()).count()
    }
}
