//! Classification of console lines against the boot transition grammar.
//!
//! The burn engine never interprets raw text itself; every line read from
//! the serial port or from the flashing tool goes through [`classify`],
//! which maps it to at most one [`PatternKind`]. The rule list is ordered
//! and first-match-wins: a BL2 stage banner must not be swallowed by the
//! generic BootROM rule, an autoboot countdown must be seen before the
//! U-Boot prompt rule gets a chance, and a Linux `login:` must win over the
//! shell prompt rule. Matching is plain substring/suffix containment on a
//! single line; the matcher keeps no state across lines.

// =============================================================================
// Public Interface
// =============================================================================

/// The named events a single console line can be classified as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternKind {
    /// `Hit any key to stop autoboot` countdown.
    Autoboot,
    /// A U-Boot command prompt (`s4_polaris#`, `=>`, `U-Boot>`, ...).
    UbootPrompt,
    /// The U-Boot version banner, e.g. `U-Boot 2021.01`.
    UbootVersion,
    /// A Linux `login:` prompt.
    LoginPrompt,
    /// A root shell prompt, e.g. `root@board:~#`.
    ShellPrompt,
    /// BootROM chatter (`chip_family_id`, `ops_bining`).
    Bootrom,
    /// BL2 secure-boot stage banner.
    Bl2,
    /// BL31 secure-boot stage banner.
    Bl31,
    /// BL32 secure-boot stage banner.
    Bl32,
    /// `USB RESET` while the board is in download mode.
    UsbReset,
    /// Board announcing a reboot/restart.
    Rebooting,
    /// The flashing tool reporting a successful burn.
    BurnSuccess,
    /// The flashing tool reporting a failed burn.
    BurnFailure,
    /// A kernel version line, the boot-verification marker.
    KernelVersion,
}

/// Classify one line of console text.
///
/// Returns the highest-priority matching [`PatternKind`], or `None` when the
/// line matches no rule. Pure function; safe to call from any context.
pub fn classify(line: &str) -> Option<PatternKind> {
    use PatternKind::*;

    // Secure-boot stages first: their banners contain substrings that the
    // later, more generic rules would also match.
    if line.contains("BL2") && line.contains("Built") {
        return Some(Bl2);
    }
    if line.contains("BL31") {
        return Some(Bl31);
    }
    if line.contains("BL32") || line.contains("BL3-2") {
        return Some(Bl32);
    }
    if line.contains("chip_family_id") || line.contains("ops_bining") {
        return Some(Bootrom);
    }
    if is_uboot_version(line) {
        return Some(UbootVersion);
    }
    // Autoboot before the prompt rules: the countdown line can end with
    // characters that look prompt-like on some boards.
    if line.contains("Hit any key to stop autoboot") {
        return Some(Autoboot);
    }
    let trimmed = line.trim_end();
    if UBOOT_PROMPTS.iter().any(|p| trimmed.ends_with(p)) {
        return Some(UbootPrompt);
    }
    if trimmed.ends_with("login:") {
        return Some(LoginPrompt);
    }
    if line.contains("root@") && trimmed.ends_with(":~#") {
        return Some(ShellPrompt);
    }
    if line.contains("USB RESET") {
        return Some(UsbReset);
    }
    if line.contains("Rebooting.") || line.contains("Restarting system") {
        return Some(Rebooting);
    }
    let lower = line.to_ascii_lowercase();
    if lower.contains("burn successful") {
        return Some(BurnSuccess);
    }
    if lower.contains("burn failed") {
        return Some(BurnFailure);
    }
    if is_kernel_version(line) {
        return Some(KernelVersion);
    }

    None
}

// =============================================================================
// Private stuff
// =============================================================================

/// U-Boot prompts seen on the supported boards. `root@` shells never match
/// these because the shell rule requires the `:~#` suffix instead.
const UBOOT_PROMPTS: &[&str] = &["s4_polaris#", "a4_mainstream#", "a4_ba400#", "=>", "U-Boot>"];

/// `U-Boot ` followed by a digit, i.e. a version banner rather than the
/// word appearing in prose.
fn is_uboot_version(line: &str) -> bool {
    line.find("U-Boot ")
        .and_then(|i| line[i + "U-Boot ".len()..].chars().next())
        .map_or(false, |c| c.is_ascii_digit())
}

/// A `uname -a` style kernel line: either the canonical `Linux version`
/// banner, or `Linux` together with one of the usual build markers.
fn is_kernel_version(line: &str) -> bool {
    if line.contains("Linux version") {
        return true;
    }
    line.contains("Linux")
        && ["#1", "SMP", "PREEMPT", "GNU/Linux"]
            .iter()
            .any(|m| line.contains(m))
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::PatternKind::*;
    use super::*;

    #[test]
    fn bl2_not_misclassified_as_bootrom() {
        let line = "BL2 Built : 15:21:22, May 27 2021. g12a gc746a9d-dirty";
        assert_eq!(classify(line), Some(Bl2));
    }

    #[test]
    fn bl31_and_bl32_banners() {
        assert_eq!(classify("NOTICE:  BL31: v2.4(release)"), Some(Bl31));
        assert_eq!(classify("BL32: welcome to optee"), Some(Bl32));
        assert_eq!(classify("INFO: BL3-2 loaded"), Some(Bl32));
    }

    #[test]
    fn bootrom_chatter() {
        assert_eq!(classify("chip_family_id: 0x32"), Some(Bootrom));
        assert_eq!(classify("ops_bining 0"), Some(Bootrom));
    }

    #[test]
    fn uboot_version_requires_a_digit() {
        assert_eq!(classify("U-Boot 2021.01 (May 27 2021)"), Some(UbootVersion));
        assert_eq!(classify("loading U-Boot image..."), None);
    }

    #[test]
    fn autoboot_wins_over_prompt_rules() {
        assert_eq!(
            classify("Hit any key to stop autoboot: 1 "),
            Some(Autoboot)
        );
    }

    #[test]
    fn uboot_prompts() {
        for p in &["s4_polaris# ", "a4_mainstream#", "=> ", "U-Boot> "] {
            assert_eq!(classify(p), Some(UbootPrompt), "prompt {:?}", p);
        }
    }

    #[test]
    fn login_wins_over_shell() {
        assert_eq!(classify("buildroot login: "), Some(LoginPrompt));
        assert_eq!(classify("root@board:~# "), Some(ShellPrompt));
    }

    #[test]
    fn shell_prompt_requires_root_prefix() {
        // A U-Boot prompt must never match the shell rule and vice versa.
        assert_eq!(classify("board:~#"), None);
        assert_ne!(classify("root@board:~#"), Some(UbootPrompt));
    }

    #[test]
    fn download_mode_lines() {
        assert_eq!(classify("[  12.3] USB RESET"), Some(UsbReset));
        assert_eq!(classify("Rebooting. Bye."), Some(Rebooting));
        assert_eq!(classify("Restarting system"), Some(Rebooting));
    }

    #[test]
    fn burn_markers_case_insensitive() {
        assert_eq!(classify("Burn Successful^_^"), Some(BurnSuccess));
        assert_eq!(classify("ERR: burn failed T_T"), Some(BurnFailure));
    }

    #[test]
    fn kernel_version_markers() {
        assert_eq!(
            classify("Linux version 5.4.125 (gcc 9.4)"),
            Some(KernelVersion)
        );
        assert_eq!(
            classify("Linux board 5.4.125 #1 SMP PREEMPT aarch64 GNU/Linux"),
            Some(KernelVersion)
        );
        assert_eq!(classify("Linux is neat"), None);
    }

    #[test]
    fn noise_matches_nothing() {
        for line in &[
            "",
            "random console noise",
            "mmc1: new HS200 MMC card",
            "[    0.000000] psci: probing for conduit method from DT.",
        ] {
            assert_eq!(classify(line), None, "line {:?}", line);
        }
    }
}
