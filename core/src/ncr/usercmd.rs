//! Runtime control commands
//!
//! Text form, one command per line:
//!
//! ```text
//! setsync  <target|all> <period factor, 0 = async>
//! setwide  <target|all> <0|1>
//! settags  <target|all> <n>
//! setorder <default|simple|ordered>
//! setdebug <flag,flag,...|none>      queue nego tags irq recovery
//! setflag  <target|all> <flag,...|none>   noscan trace
//! clearprof
//! ```

use std::str::FromStr;

use anyhow::Result;
use log::*;
use thiserror::Error;

use crate::bus::RegisterBus;
use crate::ncr::adapter::{Adapter, DebugFlags, Profile, TagOrder};
use crate::ncr::{MAX_TAGS, MAX_TARGET};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetSel {
    All,
    One(u8),
}

impl TargetSel {
    fn matches(self, id: u8) -> bool {
        match self {
            Self::All => true,
            Self::One(t) => t == id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TargetFlags {
    pub no_scan: bool,
    pub trace: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCommand {
    SetSync(TargetSel, u8),
    SetWide(TargetSel, u8),
    SetTags(TargetSel, u8),
    SetOrder(TagOrder),
    SetDebug(DebugFlags),
    SetFlag(TargetSel, TargetFlags),
    ClearProf,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserCommandError {
    #[error("empty command")]
    Empty,
    #[error("unknown command '{0}'")]
    Unknown(String),
    #[error("missing argument: {0}")]
    Missing(&'static str),
    #[error("invalid {0} '{1}'")]
    Invalid(&'static str, String),
}

fn arg<'a>(tokens: &[&'a str], i: usize, what: &'static str) -> Result<&'a str, UserCommandError> {
    tokens.get(i).copied().ok_or(UserCommandError::Missing(what))
}

fn number(tokens: &[&str], i: usize, what: &'static str) -> Result<u8, UserCommandError> {
    let s = arg(tokens, i, what)?;
    s.parse()
        .map_err(|_| UserCommandError::Invalid(what, s.to_string()))
}

fn target(tokens: &[&str]) -> Result<TargetSel, UserCommandError> {
    let s = arg(tokens, 1, "target")?;
    if s == "all" {
        return Ok(TargetSel::All);
    }
    match s.parse::<u8>() {
        Ok(t) if usize::from(t) < MAX_TARGET => Ok(TargetSel::One(t)),
        _ => Err(UserCommandError::Invalid("target", s.to_string())),
    }
}

/// Comma separated flag names, `none` for an empty set
fn flags<'a>(s: &'a str) -> impl Iterator<Item = &'a str> {
    s.split(',').filter(|f| !f.is_empty() && *f != "none")
}

impl FromStr for UserCommand {
    type Err = UserCommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = s.split_whitespace().collect::<Vec<_>>();
        let Some(&verb) = tokens.first() else {
            return Err(UserCommandError::Empty);
        };
        match verb {
            "setsync" => Ok(Self::SetSync(target(&tokens)?, number(&tokens, 2, "period")?)),
            "setwide" => {
                let width = number(&tokens, 2, "width")?;
                if width > 1 {
                    return Err(UserCommandError::Invalid("width", width.to_string()));
                }
                Ok(Self::SetWide(target(&tokens)?, width))
            }
            "settags" => Ok(Self::SetTags(target(&tokens)?, number(&tokens, 2, "tags")?)),
            "setorder" => {
                let s = arg(&tokens, 1, "order")?;
                let order = s
                    .parse()
                    .map_err(|_| UserCommandError::Invalid("order", s.to_string()))?;
                Ok(Self::SetOrder(order))
            }
            "setdebug" => {
                let mut d = DebugFlags::default();
                for f in flags(arg(&tokens, 1, "flags")?) {
                    match f {
                        "queue" => d.queue = true,
                        "nego" => d.nego = true,
                        "tags" => d.tags = true,
                        "irq" => d.irq = true,
                        "recovery" => d.recovery = true,
                        _ => return Err(UserCommandError::Invalid("debug flag", f.to_string())),
                    }
                }
                Ok(Self::SetDebug(d))
            }
            "setflag" => {
                let sel = target(&tokens)?;
                let mut tf = TargetFlags::default();
                for f in flags(arg(&tokens, 2, "flags")?) {
                    match f {
                        "noscan" => tf.no_scan = true,
                        "trace" => tf.trace = true,
                        _ => return Err(UserCommandError::Invalid("flag", f.to_string())),
                    }
                }
                Ok(Self::SetFlag(sel, tf))
            }
            "clearprof" => Ok(Self::ClearProf),
            _ => Err(UserCommandError::Unknown(verb.to_string())),
        }
    }
}

impl<C: RegisterBus> Adapter<C> {
    /// Applies a control command. Transfer settings take effect through
    /// renegotiation on the next command to each affected target.
    pub fn user_command(&mut self, cmd: UserCommand) -> Result<()> {
        info!("{}: user command {:?}", self.name, cmd);
        let wide_ok = self.config.wide;
        match cmd {
            UserCommand::SetSync(sel, period) => {
                for tcb in self.targets.iter_mut().filter(|t| sel.matches(t.id)) {
                    tcb.usrsync = period;
                    // a live synchronous agreement must be talked back down
                    tcb.sync_done = !tcb.wants_sync() && tcb.params.offset == 0;
                }
            }
            UserCommand::SetWide(sel, width) => {
                for tcb in self.targets.iter_mut().filter(|t| sel.matches(t.id)) {
                    tcb.usrwide = if wide_ok { width } else { 0 };
                    tcb.wide_done = !tcb.wants_wide() && tcb.params.width == 0;
                }
            }
            UserCommand::SetTags(sel, tags) => {
                let tags = tags.clamp(1, MAX_TAGS as u8);
                for tcb in self.targets.iter_mut().filter(|t| sel.matches(t.id)) {
                    tcb.usrtags = if tcb.quirks.no_message { 1 } else { tags };
                    let usetags = tcb.wants_tags();
                    let maxtags = tcb.usrtags;
                    for lcb in tcb.lcbs.iter_mut().flatten() {
                        lcb.setup_tags(usetags, maxtags);
                    }
                }
            }
            UserCommand::SetOrder(order) => self.order = order,
            UserCommand::SetDebug(flags) => self.debug = flags,
            UserCommand::SetFlag(sel, flags) => {
                for tcb in self.targets.iter_mut().filter(|t| sel.matches(t.id)) {
                    tcb.no_scan = flags.no_scan;
                    tcb.trace = flags.trace;
                }
            }
            UserCommand::ClearProf => self.profile = Profile::default(),
        }
        Ok(())
    }
}
