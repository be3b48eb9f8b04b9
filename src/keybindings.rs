/// Centralized keybinding definitions for clashtop
/// This keeps the help overlay, status bar and key handlers in sync

#[derive(Debug, Clone)]
pub struct KeyBinding {
    pub key: &'static str,
    pub description: &'static str,
    pub category: KeyCategory,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyCategory {
    Navigation,
    Table,
    Actions,
    System,
}

impl KeyCategory {
    pub fn title(&self) -> &'static str {
        match self {
            KeyCategory::Navigation => "Navigation",
            KeyCategory::Table => "Table",
            KeyCategory::Actions => "Actions",
            KeyCategory::System => "System",
        }
    }
}

/// Get all keybindings
pub fn get_all_keybindings() -> Vec<KeyBinding> {
    vec![
        // Navigation
        KeyBinding {
            key: "↑/k",
            description: "Move selection up",
            category: KeyCategory::Navigation,
        },
        KeyBinding {
            key: "↓/j",
            description: "Move selection down",
            category: KeyCategory::Navigation,
        },
        KeyBinding {
            key: "d",
            description: "Cycle device filter (All / per source IP)",
            category: KeyCategory::Navigation,
        },
        // Table
        KeyBinding {
            key: "s",
            description: "Sort by next column",
            category: KeyCategory::Table,
        },
        KeyBinding {
            key: "S",
            description: "Reverse sort direction",
            category: KeyCategory::Table,
        },
        KeyBinding {
            key: "1-9",
            description: "Sort by column N (again to reverse)",
            category: KeyCategory::Table,
        },
        // Actions
        KeyBinding {
            key: "c",
            description: "Toggle keep closed connections",
            category: KeyCategory::Actions,
        },
        KeyBinding {
            key: "x",
            description: "Close selected connection",
            category: KeyCategory::Actions,
        },
        KeyBinding {
            key: "X",
            description: "Close all connections",
            category: KeyCategory::Actions,
        },
        // System
        KeyBinding {
            key: "h/?",
            description: "Toggle this help",
            category: KeyCategory::System,
        },
        KeyBinding {
            key: "q/Esc",
            description: "Quit (or close dialog if open)",
            category: KeyCategory::System,
        },
        KeyBinding {
            key: "Ctrl+C",
            description: "Force quit (always exits)",
            category: KeyCategory::System,
        },
    ]
}

/// Get keybindings for the status bar (most common ones)
pub fn get_status_bar_keybindings() -> Vec<(&'static str, &'static str)> {
    vec![
        ("↑↓", "Navigate"),
        ("s", "Sort"),
        ("d", "Device"),
        ("c", "Keep closed"),
        ("X", "Close all"),
        ("h", "Help"),
        ("q", "Quit"),
    ]
}
