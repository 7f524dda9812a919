use std::fmt::Display;

/// How an active procedure call should be canceled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CallCancelMode {
    /// An ERROR is sent immediately back to the caller. The callee receives no INTERRUPT.
    #[default]
    Skip,
    /// INTERRUPT is sent to the callee, and an ERROR is sent immediately back to the caller. The
    /// invocation stays open until the callee answers, and the answer is discarded.
    Kill,
    /// INTERRUPT is sent to the callee, and an ERROR is sent immediately back to the caller. The
    /// invocation is discarded right away.
    KillNoWait,
}

impl CallCancelMode {
    /// Whether the callee should receive an INTERRUPT.
    pub fn interrupts_callee(&self) -> bool {
        match self {
            Self::Skip => false,
            Self::Kill | Self::KillNoWait => true,
        }
    }
}

impl TryFrom<&str> for CallCancelMode {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "skip" => Ok(Self::Skip),
            "kill" => Ok(Self::Kill),
            "killnowait" => Ok(Self::KillNoWait),
            _ => Err(Self::Error::msg(format!(
                "invalid call cancel mode: {value}"
            ))),
        }
    }
}

impl From<CallCancelMode> for &'static str {
    fn from(value: CallCancelMode) -> Self {
        match value {
            CallCancelMode::Skip => "skip",
            CallCancelMode::Kill => "kill",
            CallCancelMode::KillNoWait => "killnowait",
        }
    }
}

impl Display for CallCancelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str((*self).into())
    }
}
