//! Localisable status messages.
//!
//! Records and errors carry a message id plus positional arguments; the text
//! is resolved only when a response is produced, in the caller's language.

/// Resolves a message id to display text.
pub trait Localizer: Send + Sync {
    /// Text for `id` in `lang`, with `{0}`, `{1}`, ... replaced by `args`.
    fn message(&self, lang: &str, id: &str, args: &[String]) -> String;
}

/// Built-in English catalog. Unknown ids resolve to the id itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMessages;

const CATALOG: &[(&str, &str)] = &[
    ("BuildUploading", "Uploading build"),
    ("BuildUploaded", "Build uploaded"),
    ("BuildExtracted", "Build extracted"),
    ("BuildBuilding", "Building"),
    ("BuildComplete", "Build completed successfully"),
    ("BuildInvalid", "Build request was invalid"),
    ("BuildError", "Build failed"),
    ("BuildEmulated", "Build launched in the emulator"),
    ("BuildRunning", "Build is running on the device"),
    ("BuildInstalled", "Build installed on the device"),
    ("BuildDebugging", "Build is being debugged"),
    ("BuildDownloaded", "Build downloaded"),
    ("BuildCrashed", "Build crashed"),
    ("BuildTerminated", "Build terminated"),
    ("InvalidBuildSubmission400", "Invalid build submission: {0}"),
    ("BuildQueueFull", "Build queue is full, {0} builds are waiting"),
    ("ErrorUploading", "Error uploading build {0}: {1}"),
    ("ErrorExtracting", "Error extracting archive {0}: {1}"),
    ("BuildFailedWithError", "Build failed: {0}"),
    ("BuildInvokedTwice", "Build {0} was started twice on the same worker"),
    ("BuildNotFound", "Build {0} not found"),
    ("MalformedBuildInfo", "Build {0} has no builder attached"),
    ("BuildNotComplete", "Build {0} has not completed"),
    ("EmulateDisabled", "Emulation is disabled on this server"),
    ("NoMatchingBuilder", "No builder available for platform {0} version {1}"),
    ("BuilderLoadFailed", "Unable to load builder {0}: {1}"),
    ("InvalidPin", "PIN {0} is not valid"),
    ("ExpiredPin", "PIN {0} has expired"),
    ("InternalServerError", "Internal server error: {0}"),
];

impl Localizer for DefaultMessages {
    fn message(&self, _lang: &str, id: &str, args: &[String]) -> String {
        let template = CATALOG
            .iter()
            .find(|(key, _)| *key == id)
            .map_or(id, |(_, text)| *text);
        format_message(template, args)
    }
}

/// Substitute positional `{n}` placeholders. Missing arguments stay verbatim.
pub fn format_message(template: &str, args: &[String]) -> String {
    let mut out = template.to_string();
    for (i, arg) in args.iter().enumerate() {
        out = out.replace(&format!("{{{i}}}"), arg);
    }
    out
}
