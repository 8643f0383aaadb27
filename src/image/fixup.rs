//! Hard-link reconstruction after decoding a dentry tree.
//!
//! On disk every dentry carries its own copy of the inode fields; dentries
//! that were hard links to one file share a nonzero hard-link group ID.
//! This pass collapses each group back to a single inode.

use log::warn;

use super::{Image, Inode};

/// Collapse dentries sharing a hard-link group ID onto one inode each, drop
/// the orphaned per-dentry inodes, and rebuild link counts.
///
/// Group ID 0 means "no group"; reparse points never carry a group (the
/// on-disk field is overlaid by the reparse tag). A dentry whose inode fields
/// disagree with its group's first member keeps its own inode, with a
/// warning, rather than corrupting the shared one.
pub fn fix_inodes(image: &mut Image) {
    let mut groups: std::collections::HashMap<u64, super::InodeId> =
        std::collections::HashMap::new();

    for id in image.preorder_ids() {
        let iid = image.dentry(id).inode;
        let inode = image.inode(iid);
        let group = inode.ino;
        if group == 0 || inode.is_reparse_point() {
            continue;
        }
        match groups.get(&group) {
            None => {
                groups.insert(group, iid);
            }
            Some(&canonical) => {
                if inodes_consistent(image.inode(canonical), image.inode(iid)) {
                    image.dentry_mut(id).inode = canonical;
                } else {
                    warn!(
                        "dentry \"{}\" disagrees with hard link group {group:#x}; \
                         treating it as a separate file",
                        super::utf16_display(&image.dentry(id).name)
                    );
                }
            }
        }
    }

    image.compact_inodes();
}

/// Whether two decoded inodes describe the same file object.
fn inodes_consistent(a: &Inode, b: &Inode) -> bool {
    a.attributes == b.attributes
        && a.security_id == b.security_id
        && a.creation_time == b.creation_time
        && a.last_write_time == b.last_write_time
        && a.last_access_time == b.last_access_time
        && a.streams.len() == b.streams.len()
        && a
            .streams
            .iter()
            .zip(&b.streams)
            .all(|(x, y)| x.stream_type == y.stream_type && x.name == y.name && x.hash == y.hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{utf16, DentryId, Stream, StreamType};
    use crate::ntfs::FILE_ATTRIBUTE_DIRECTORY;

    fn data_stream(hash_byte: u8) -> Stream {
        Stream {
            stream_type: StreamType::Data,
            name: Vec::new(),
            hash: [hash_byte; 20],
            blob: None,
        }
    }

    fn add_file(image: &mut Image, root: DentryId, name: &str, group: u64, hash_byte: u8) -> DentryId {
        let mut inode = Inode::new(group);
        inode.nlink = 0;
        inode.streams.push(data_stream(hash_byte));
        let iid = image.new_inode(inode);
        let id = image.new_dentry(utf16(name), iid);
        image.add_child(root, id);
        id
    }

    fn tree() -> (Image, DentryId) {
        let mut image = Image::new();
        let mut root_inode = Inode::new(0);
        root_inode.attributes = FILE_ATTRIBUTE_DIRECTORY;
        let iid = image.new_inode(root_inode);
        let root = image.new_dentry(Vec::new(), iid);
        image.root = Some(root);
        (image, root)
    }

    #[test]
    fn test_group_collapses_to_one_inode() {
        let (mut image, root) = tree();
        let a = add_file(&mut image, root, "a", 42, 1);
        let b = add_file(&mut image, root, "b", 42, 1);
        let c = add_file(&mut image, root, "c", 0, 2);

        fix_inodes(&mut image);

        assert_eq!(image.dentry(a).inode, image.dentry(b).inode);
        assert_ne!(image.dentry(a).inode, image.dentry(c).inode);
        assert_eq!(image.inode_of(a).nlink, 2);
        assert_eq!(image.inode_of(c).nlink, 1);
        // root + shared + unique
        assert_eq!(image.inodes.len(), 3);
    }

    #[test]
    fn test_inconsistent_member_kept_separate() {
        let (mut image, root) = tree();
        let a = add_file(&mut image, root, "a", 42, 1);
        let b = add_file(&mut image, root, "b", 42, 9); // different stream hash

        fix_inodes(&mut image);

        assert_ne!(image.dentry(a).inode, image.dentry(b).inode);
        assert_eq!(image.inode_of(a).nlink, 1);
        assert_eq!(image.inode_of(b).nlink, 1);
    }

    #[test]
    fn test_group_zero_never_merges() {
        let (mut image, root) = tree();
        let a = add_file(&mut image, root, "a", 0, 1);
        let b = add_file(&mut image, root, "b", 0, 1);

        fix_inodes(&mut image);
        assert_ne!(image.dentry(a).inode, image.dentry(b).inode);
    }
}
