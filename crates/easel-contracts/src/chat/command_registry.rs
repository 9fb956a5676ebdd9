#[derive(Clone, Copy, Debug)]
pub(crate) struct CommandSpec {
    pub command: &'static str,
    pub action: &'static str,
}

/// Commands whose whole remainder is one raw value.
pub(crate) const RAW_ARG_COMMANDS: &[CommandSpec] = &[CommandSpec {
    command: "key",
    action: "set_api_key",
}];

/// Commands taking a single gallery target (position or id prefix).
pub(crate) const TARGET_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "show",
        action: "select_image",
    },
    CommandSpec {
        command: "delete",
        action: "delete_image",
    },
    CommandSpec {
        command: "prompt",
        action: "show_prompt",
    },
];

pub(crate) const SAVE_COMMAND: CommandSpec = CommandSpec {
    command: "save",
    action: "save_image",
};

pub(crate) const NO_ARG_COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        command: "list",
        action: "list_images",
    },
    CommandSpec {
        command: "status",
        action: "status",
    },
    CommandSpec {
        command: "wait",
        action: "wait",
    },
    CommandSpec {
        command: "dismiss",
        action: "dismiss_notice",
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
    "/key <api key>",
    "/list",
    "/show <n|id>",
    "/prompt [n|id]",
    "/delete <n|id>",
    "/save <n|id> <path>",
    "/status",
    "/wait",
    "/dismiss",
    "/help",
    "/quit",
];
