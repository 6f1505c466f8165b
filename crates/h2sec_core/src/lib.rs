pub mod engine;
pub mod report;

use h2sec_harness::TestGroup;

/// Root of the check tree, groups in CVE order.
pub fn security_group() -> TestGroup {
    let mut root = TestGroup::new("", "Security tests for HTTP/2 server");
    root.add_group(mod_dependency_cycle::group());
    root.add_group(mod_stream_reuse::group());
    root.add_group(mod_hpack_bomb::group());
    root.add_group(mod_slow_read::group());
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_has_every_scenario() {
        let root = security_group();
        assert_eq!(root.key, "sec");
        let sections: Vec<&str> = root.groups.iter().map(|g| g.section.as_str()).collect();
        assert_eq!(
            sections,
            vec!["CVE-2015-8659", "CVE-2016-0150", "CVE-2016-1544", "CVE-2016-1546"]
        );
        assert_eq!(root.case_count(), 5);
    }
}
