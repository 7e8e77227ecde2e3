use std::io::{self, Write};
use std::path::PathBuf;

use tracing::debug;

use super::replica::{NodeKind, Replica};

pub const LOCAL_BEFORE: &str = "local-before";
pub const REMOTE_BEFORE: &str = "remote-before";
pub const LOCAL_AFTER: &str = "local-after";
pub const REMOTE_AFTER: &str = "remote-after";
pub const REMOTE_CANDIDATE: &str = "remote-candidate";

/// Writes the forensic tree listings produced around every refresh: one
/// line per node, `<kind>\t<size>\t<mtime>\t<path>`, sorted by path.
pub struct StateDumper {
    dir: PathBuf,
}

impl StateDumper {
    pub fn new(dir: PathBuf) -> io::Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dump(&self, name: &str, replica: &Replica) -> io::Result<()> {
        let path = self.dir.join(format!("icloudds-{name}.txt"));
        let mut out = io::BufWriter::new(std::fs::File::create(&path)?);
        for node in replica.iter() {
            let kind = match node.kind {
                NodeKind::Folder => "folder",
                NodeKind::File => "file",
            };
            writeln!(
                out,
                "{kind}\t{}\t{}\t{}",
                node.size.unwrap_or(0),
                node.mtime.unwrap_or(0),
                node.path
            )?;
        }
        out.flush()?;
        debug!(file = %path.display(), nodes = replica.count_nodes(), "state dumped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::replica::Node;
    use tempfile::tempdir;

    #[test]
    fn dump_is_tab_separated_and_path_sorted() {
        let dir = tempdir().unwrap();
        let dumper = StateDumper::new(dir.path().join("state")).unwrap();
        let mut replica = Replica::new();
        replica.insert(Node::file("b.txt", 7, 1_700_000_000));
        replica.insert(Node::folder("A"));
        replica.insert(Node::file("A/a.txt", 3, 1_700_000_100));

        dumper.dump(LOCAL_BEFORE, &replica).unwrap();
        let raw =
            std::fs::read_to_string(dir.path().join("state/icloudds-local-before.txt")).unwrap();
        assert_eq!(
            raw,
            "folder\t0\t0\tA\nfile\t3\t1700000100\tA/a.txt\nfile\t7\t1700000000\tb.txt\n"
        );
    }
}
