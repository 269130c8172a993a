mod build;
mod gc;
mod images;
mod info;
mod inspect;
mod plan;
mod run;

pub use build::{BuildOptions, cmd_build};
pub use gc::cmd_gc;
pub use images::cmd_images;
pub use info::cmd_info;
pub use inspect::cmd_inspect;
pub use plan::cmd_plan;
pub use run::{RunArgs, cmd_run};

use anyhow::{Result, bail};

use layerforge_lib::recipe::SourceMode;
use layerforge_lib::steps::Isolation;

fn parse_isolation(value: Option<&str>) -> Result<Option<Isolation>> {
  match value {
    None => Ok(None),
    Some(v) => match Isolation::parse(v) {
      Some(isolation) => Ok(Some(isolation)),
      None => bail!("unknown isolation '{v}' (expected chroot or host)"),
    },
  }
}

fn parse_source_mode(value: Option<&str>) -> Result<Option<SourceMode>> {
  match value {
    None => Ok(None),
    Some(v) => match SourceMode::parse(v) {
      Some(mode) => Ok(Some(mode)),
      None => bail!("unknown source mode '{v}' (expected materialized or mounted)"),
    },
  }
}
