use anstyle::{AnsiColor, Color, Effects, Style};

pub(crate) fn print_status_msg(status: StatusType, message: &str) {
    let style = status.style();
    let status_str = status.as_str();

    eprintln!("{style}{status_str:>12}{style:#} {message}");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusType {
    // Key status
    Key,
    Locked,
    Unlocked,
    Cached,
    Missing,
    // Completed ops
    Cleared,
    Flushed,
    // Diagnostics
    Warning,
    Error,
}

impl StatusType {
    fn style(self) -> Style {
        let base_style = Style::new() | Effects::BOLD;

        match self {
            StatusType::Key => base_style.fg_color(Some(Color::Ansi(AnsiColor::BrightBlue))),
            StatusType::Locked => base_style.fg_color(Some(Color::Ansi(AnsiColor::BrightMagenta))),
            StatusType::Cached => base_style.fg_color(Some(Color::Ansi(AnsiColor::BrightGreen))),
            StatusType::Unlocked | StatusType::Missing => {
                base_style.fg_color(Some(Color::Ansi(AnsiColor::White)))
            }
            StatusType::Cleared | StatusType::Flushed => {
                base_style.fg_color(Some(Color::Ansi(AnsiColor::Green)))
            }
            StatusType::Warning => base_style.fg_color(Some(Color::Ansi(AnsiColor::Yellow))),
            StatusType::Error => base_style.fg_color(Some(Color::Ansi(AnsiColor::Red))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            StatusType::Key => "Key",
            StatusType::Locked => "Locked",
            StatusType::Unlocked => "Unlocked",
            StatusType::Cached => "Cached",
            StatusType::Missing => "Missing",
            StatusType::Cleared => "Cleared",
            StatusType::Flushed => "Flushed",
            StatusType::Warning => "Warning",
            StatusType::Error => "Error",
        }
    }
}
