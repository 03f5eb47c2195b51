pub use std::collections::{HashMap, HashSet};
pub use std::fmt::Display;
pub use std::io::prelude::*;
pub use std::path::{Path, PathBuf};

pub use eyre::{bail, eyre, Result, WrapErr};
pub use once_cell::sync::Lazy;
pub use serde::{Deserialize, Serialize};
pub use tracing::{debug, error, info, trace, warn};

pub use crate::error::{CacheError, HeaderError, ProcessError};
pub use crate::header::Timestamp;
