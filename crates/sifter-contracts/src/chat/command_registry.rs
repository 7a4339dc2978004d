#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "detector",
        action: "set_detector",
    },
    CommandSpec {
        command: "model",
        action: "set_model",
    },
];

pub(crate) const SINGLE_PATH_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "use",
        action: "set_active_gif",
    },
    CommandSpec {
        command: "save",
        action: "save",
    },
    CommandSpec {
        command: "preview",
        action: "preview",
    },
];

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "reset",
        action: "reset",
    },
    CommandSpec {
        command: "history",
        action: "history",
    },
    CommandSpec {
        command: "undo",
        action: "undo",
    },
    CommandSpec {
        command: "help",
        action: "help",
    },
    CommandSpec {
        command: "quit",
        action: "quit",
    },
    CommandSpec {
        command: "exit",
        action: "quit",
    },
];

pub const CHAT_HELP_COMMANDS: &[&str] = &[
    "/detector",
    "/model",
    "/use",
    "/save",
    "/preview",
    "/reset",
    "/history",
    "/undo",
    "/help",
    "/quit",
];
