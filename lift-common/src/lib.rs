pub mod config;

pub mod event_bus;

pub mod events;

pub mod scheduler;

pub mod session;

pub mod snapshot;

pub mod drawing_support {
    /// Team names longer than this are shown in the wide layout
    pub const DEFAULT_WIDE_TEAM_NAME_LEN: usize = 10;
    pub const INVITED_LABEL_KEY: &str = "Results.Extra/Invited";
    pub const EMPTY_CELL: &str = "-";
}
