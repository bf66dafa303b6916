/// Outbound line sent to the bench controller. Fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// PWM throttle in microseconds; the firmware clamps to 1000..=2000.
    Throttle(i32),
    Reboot,
    /// Arbitrary text line; a terminator is appended when rendering if absent.
    Raw(String),
}

impl Command {
    pub fn raw(text: impl Into<String>) -> Self {
        let mut text = text.into();
        if !text.ends_with('\n') {
            text.push('\n');
        }
        Command::Raw(text)
    }

    /// Newline-terminated ASCII line as written to the wire.
    pub fn to_line(&self) -> String {
        match self {
            Command::Throttle(pwm) => format!("{}\n", pwm),
            Command::Reboot => "reboot\n".to_string(),
            Command::Raw(text) if text.ends_with('\n') => text.clone(),
            Command::Raw(text) => format!("{}\n", text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_renders_decimal_line() {
        assert_eq!(Command::Throttle(1500).to_line(), "1500\n");
    }

    #[test]
    fn reboot_is_literal() {
        assert_eq!(Command::Reboot.to_line(), "reboot\n");
    }

    #[test]
    fn raw_gets_single_terminator() {
        assert_eq!(Command::raw("1200").to_line(), "1200\n");
        assert_eq!(Command::raw("1200\n").to_line(), "1200\n");
        // built without the constructor
        assert_eq!(Command::Raw("reboot".into()).to_line(), "reboot\n");
    }
}
