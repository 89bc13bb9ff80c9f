use console::style;

/// Print success message
pub fn success(msg: &str) {
    println!("{} {}", style("✔").green(), msg);
}

/// Print error message
pub fn error(msg: &str) {
    println!("{} {}", style("✖").red(), msg);
}

/// Print info message (indented)
pub fn info(msg: &str) {
    println!("  {}", msg);
}

/// Print a bold section title with a rule under it
pub fn section(title: &str) {
    println!();
    println!("  {}", style(title).bold());
    println!("  {}", "─".repeat(45));
}
