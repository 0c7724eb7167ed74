//! Host-owned summary of the session, replayed to late joiners.

use syncroom_types::UpstreamRecord;

use crate::config::Catalog;

/// How the engine treats an upstream record, decided by its `func`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Registration,
    Navigation,
    Selection,
    Launch,
    Start,
    End,
    Gameplay,
    Other,
}

impl Category {
    /// Traffic withheld from peers waiting for the current activity to end.
    pub fn is_gameplay(self) -> bool {
        self == Self::Gameplay
    }

    /// Slots that belong to one activity and are cleared when it ends.
    pub fn is_activity_scoped(self) -> bool {
        matches!(self, Self::Selection | Self::Launch | Self::Start)
    }
}

impl Catalog {
    pub fn classify(&self, func: &str) -> Category {
        if func == self.registration {
            Category::Registration
        } else if func == self.navigation {
            Category::Navigation
        } else if func == self.selection {
            Category::Selection
        } else if func == self.launch {
            Category::Launch
        } else if func == self.start {
            Category::Start
        } else if func == self.end {
            Category::End
        } else if self.gameplay.iter().any(|g| g == func) {
            Category::Gameplay
        } else {
            Category::Other
        }
    }
}

/// Slots a late joiner is brought up to date with, in replay order.
pub const REPLAY_ORDER: [Category; 4] = [
    Category::Navigation,
    Category::Selection,
    Category::Launch,
    Category::Start,
];

/// Most recent record of each tracked category.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    registration: Option<UpstreamRecord>,
    navigation: Option<UpstreamRecord>,
    selection: Option<UpstreamRecord>,
    launch: Option<UpstreamRecord>,
    start: Option<UpstreamRecord>,
    mid_activity: bool,
}

impl SessionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a host-observed record into the snapshot.
    ///
    /// A start marks the session mid-activity; an end clears the
    /// activity-scoped slots (selection, launch, start) and the flag.
    pub fn ingest(&mut self, catalog: &Catalog, record: &UpstreamRecord) -> Category {
        let category = catalog.classify(record.func());
        match category {
            Category::Registration => self.registration = Some(record.clone()),
            Category::Navigation => self.navigation = Some(record.clone()),
            Category::Selection => self.selection = Some(record.clone()),
            Category::Launch => self.launch = Some(record.clone()),
            Category::Start => {
                self.start = Some(record.clone());
                self.mid_activity = true;
            }
            Category::End => {
                self.selection = None;
                self.launch = None;
                self.start = None;
                self.mid_activity = false;
            }
            Category::Gameplay | Category::Other => {}
        }
        category
    }

    pub fn get(&self, category: Category) -> Option<&UpstreamRecord> {
        match category {
            Category::Registration => self.registration.as_ref(),
            Category::Navigation => self.navigation.as_ref(),
            Category::Selection => self.selection.as_ref(),
            Category::Launch => self.launch.as_ref(),
            Category::Start => self.start.as_ref(),
            Category::End | Category::Gameplay | Category::Other => None,
        }
    }

    pub fn registration(&self) -> Option<&UpstreamRecord> {
        self.registration.as_ref()
    }

    pub fn is_mid_activity(&self) -> bool {
        self.mid_activity
    }

    /// Categories to replay to a joiner right now.
    ///
    /// Mid-activity joiners only get navigation; they sit out the running
    /// activity.
    pub fn replay_plan(&self) -> Vec<Category> {
        if self.mid_activity {
            vec![Category::Navigation]
        } else {
            REPLAY_ORDER.to_vec()
        }
    }
}
