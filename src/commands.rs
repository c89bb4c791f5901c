//! The command surface: a line-oriented loop in the fast-import style that
//! the outer driver feeds on stdin.
//!
//! `store` and `set` are the import entry points; `blob`, `commit`,
//! `reset`, `get-mark`, `cat-blob` and `ls` are the fast-import subset the
//! driver uses to move preexisting state in and out (notes trees are
//! reseeded when their sentinel refs are written). Binary payloads follow
//! their command line directly, length-prefixed. Everything written to the
//! output stream is protocol; diagnostics go through `tracing`.

use std::io::{BufRead, Write};

use bstr::{BString, ByteSlice};
use bytes::Bytes;
use tracing::debug;

use crate::changegroup::{ChangegroupReader, DeltaSource, RevChunk};
use crate::errors::BridgeError;
use crate::hash::{EMPTY_TREE_OID, GitOid, HgOid};
use crate::internal::object::blob::Blob;
use crate::internal::object::commit::Commit;
use crate::internal::object::tree::{Tree, TreeItem, TreeItemMode};
use crate::internal::object::types::ObjectType;
use crate::odb::Odb;
use crate::store::Engine;

const NULL_HEX: &[u8] = b"0000000000000000000000000000000000000000";

/// Line reader with one line of lookahead, plus raw payload reads.
struct CommandStream<'a, R: BufRead> {
    input: &'a mut R,
    peeked: Option<BString>,
}

impl<'a, R: BufRead> CommandStream<'a, R> {
    fn new(input: &'a mut R) -> CommandStream<'a, R> {
        CommandStream {
            input,
            peeked: None,
        }
    }

    fn read_line(&mut self) -> Result<Option<BString>, BridgeError> {
        let mut line = Vec::new();
        if self.input.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        Ok(Some(BString::from(line)))
    }

    fn next_line(&mut self) -> Result<Option<BString>, BridgeError> {
        if let Some(line) = self.peeked.take() {
            return Ok(Some(line));
        }
        self.read_line()
    }

    fn peek_line(&mut self) -> Result<Option<&[u8]>, BridgeError> {
        if self.peeked.is_none() {
            self.peeked = self.read_line()?;
        }
        Ok(self.peeked.as_deref().map(|line| line.as_bytes()))
    }

    /// Consume the next line if it starts with `prefix`; returns the rest.
    fn take_prefixed(&mut self, prefix: &[u8]) -> Result<Option<BString>, BridgeError> {
        if !self
            .peek_line()?
            .is_some_and(|line| line.starts_with(prefix))
        {
            return Ok(None);
        }
        let line = self.next_line()?.expect("peeked line is present");
        Ok(Some(BString::from(&line[prefix.len()..])))
    }

    /// Consume the next line if it equals `expected`.
    fn take_exact(&mut self, expected: &[u8]) -> Result<bool, BridgeError> {
        let matches = self.peek_line()?.is_some_and(|line| line == expected);
        if matches {
            self.next_line()?;
        }
        Ok(matches)
    }

    /// Raw payload bytes; only legal directly after a command line.
    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, BridgeError> {
        if self.peeked.is_some() {
            return Err(BridgeError::ProtocolViolation(
                "binary payload after lookahead".into(),
            ));
        }
        let mut payload = vec![0u8; len];
        self.input.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// `data <n>` framing with the optional trailing newline.
    fn read_data(&mut self) -> Result<Vec<u8>, BridgeError> {
        let line = self
            .next_line()?
            .ok_or_else(|| BridgeError::ProtocolViolation("missing data command".into()))?;
        let len = line
            .strip_prefix(b"data ")
            .and_then(|arg| arg.to_str().ok())
            .and_then(|arg| arg.parse::<usize>().ok())
            .ok_or_else(|| {
                BridgeError::ProtocolViolation(format!("bad data framing `{}`", line))
            })?;
        let payload = self.read_exact(len)?;
        self.skip_optional_newline()?;
        Ok(payload)
    }

    fn skip_optional_newline(&mut self) -> Result<(), BridgeError> {
        let buf = self.input.fill_buf()?;
        if buf.first() == Some(&b'\n') {
            self.input.consume(1);
        }
        Ok(())
    }

    /// The underlying reader, for stream formats with their own framing.
    fn inner(&mut self) -> Result<&mut R, BridgeError> {
        if self.peeked.is_some() {
            return Err(BridgeError::ProtocolViolation(
                "binary stream after lookahead".into(),
            ));
        }
        Ok(self.input)
    }
}

/// Run the command loop until `done` or end of stream, then finish the
/// session (flush notes, write heads, finalize the pack).
pub fn run<R: BufRead, W: Write>(
    engine: &mut Engine,
    input: &mut R,
    output: &mut W,
) -> Result<(), BridgeError> {
    let mut stream = CommandStream::new(input);
    let mut saw_done = false;
    while let Some(line) = stream.next_line()? {
        if line.is_empty() {
            continue;
        }
        let mut tokens = line.split(|&b| b == b' ');
        let verb = tokens.next().unwrap_or(b"");
        let args: Vec<&[u8]> = tokens.collect();
        match verb {
            b"feature" => cmd_feature(engine, &args)?,
            b"blob" => cmd_blob(engine, &mut stream)?,
            b"commit" => cmd_commit(engine, &mut stream, &args)?,
            b"reset" => cmd_reset(engine, &mut stream, &args)?,
            b"get-mark" => cmd_get_mark(engine, output, &args)?,
            b"cat-blob" => cmd_cat_blob(engine, output, &args)?,
            b"ls" => cmd_ls(engine, output, &args)?,
            b"set" => cmd_set(engine, &args)?,
            b"store" => cmd_store(engine, &mut stream, output, &args)?,
            b"done" => {
                saw_done = true;
                break;
            }
            other => {
                return Err(BridgeError::ProtocolViolation(format!(
                    "unknown command `{}`",
                    other.as_bstr()
                )));
            }
        }
        output.flush()?;
    }
    if engine.done_required && !saw_done {
        return Err(BridgeError::ProtocolViolation(
            "stream ended without done".into(),
        ));
    }
    engine.finish()?;
    output.flush()?;
    Ok(())
}

fn one_arg<'a>(args: &[&'a [u8]], usage: &str) -> Result<&'a [u8], BridgeError> {
    match args {
        [arg] => Ok(*arg),
        _ => Err(BridgeError::ProtocolViolation(format!(
            "expected `{usage}`"
        ))),
    }
}

fn parse_mark(token: &[u8]) -> Option<u64> {
    token
        .strip_prefix(b":")
        .and_then(|digits| digits.to_str().ok())
        .and_then(|digits| digits.parse().ok())
}

/// Resolve a dataref/committish: `:h<hex>[:<path>]`, a mark, a 40-hex oid,
/// or a ref name.
fn resolve_dataref(engine: &mut Engine, token: &[u8]) -> Result<GitOid, BridgeError> {
    if let Some(rest) = token.strip_prefix(b":h") {
        if rest.len() < 40 {
            return Err(BridgeError::InvalidSha(token.as_bstr().to_string()));
        }
        let node = HgOid::from_hex(&rest[..40])?;
        let path = match &rest[40..] {
            b"" => None,
            tail => Some(tail.strip_prefix(b":").ok_or_else(|| {
                BridgeError::ProtocolViolation(format!("bad reference `{}`", token.as_bstr()))
            })?),
        };
        return engine.resolve_hg_ref(node, path);
    }
    if let Some(mark) = parse_mark(token) {
        return engine.marks.get(&mark).copied().ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("unknown mark :{mark}"))
        });
    }
    if token.len() == 40 {
        return GitOid::from_hex(token);
    }
    let name = token.to_str().map_err(|_| {
        BridgeError::ProtocolViolation(format!("bad reference `{}`", token.as_bstr()))
    })?;
    engine
        .refs
        .get(name)
        .ok_or_else(|| BridgeError::ObjectNotFound(name.to_string()))
}

fn cmd_feature(engine: &mut Engine, args: &[&[u8]]) -> Result<(), BridgeError> {
    let feature = one_arg(args, "feature <name>")?;
    match feature {
        b"done" => engine.done_required = true,
        b"update-shallow" => engine.update_shallow = true,
        other => debug!(feature = %other.as_bstr(), "feature passed through"),
    }
    Ok(())
}

fn cmd_blob<R: BufRead>(
    engine: &mut Engine,
    stream: &mut CommandStream<R>,
) -> Result<(), BridgeError> {
    let mut mark = None;
    if let Some(rest) = stream.take_prefixed(b"mark ")? {
        mark = Some(parse_mark(&rest).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("bad mark `{rest}`"))
        })?);
    }
    let payload = stream.read_data()?;
    let oid = engine.odb.write_object(ObjectType::Blob, &payload)?;
    if let Some(mark) = mark {
        engine.marks.insert(mark, oid);
    }
    Ok(())
}

fn cmd_commit<R: BufRead>(
    engine: &mut Engine,
    stream: &mut CommandStream<R>,
    args: &[&[u8]],
) -> Result<(), BridgeError> {
    let ref_name = one_arg(args, "commit <ref>")?
        .to_str()
        .map_err(|_| BridgeError::ProtocolViolation("non-utf8 ref name".into()))?
        .to_string();

    let mut mark = None;
    if let Some(rest) = stream.take_prefixed(b"mark ")? {
        mark = Some(parse_mark(&rest).ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("bad mark `{rest}`"))
        })?);
    }
    let author = stream.take_prefixed(b"author ")?;
    let committer = stream
        .take_prefixed(b"committer ")?
        .ok_or_else(|| BridgeError::ProtocolViolation("commit without committer".into()))?;
    let message = stream.read_data()?;

    let mut parents = Vec::new();
    let mut tree = EMPTY_TREE_OID;
    let mut explicit_from = false;
    if let Some(token) = stream.take_prefixed(b"from ")? {
        explicit_from = true;
        if token != NULL_HEX {
            let base = resolve_dataref(engine, &token)?;
            tree = engine.odb.read_commit(&base)?.tree_id;
            parents.push(base);
        }
    }
    if !explicit_from && let Some(tip) = engine.refs.get(&ref_name) {
        tree = engine.odb.read_commit(&tip)?.tree_id;
        parents.push(tip);
    }
    while let Some(token) = stream.take_prefixed(b"merge ")? {
        parents.push(resolve_dataref(engine, &token)?);
    }

    loop {
        if stream.take_exact(b"deleteall")? {
            tree = EMPTY_TREE_OID;
            continue;
        }
        if let Some(change) = stream.take_prefixed(b"M ")? {
            let mut fields = change.splitn(3, |&b| b == b' ');
            let (Some(mode), Some(dataref), Some(path)) =
                (fields.next(), fields.next(), fields.next())
            else {
                return Err(BridgeError::ProtocolViolation(format!(
                    "bad file modification `M {change}`"
                )));
            };
            let mode = TreeItemMode::from_bytes(mode)?;
            let oid = resolve_dataref(engine, dataref)?;
            tree = tree_edit(&mut engine.odb, tree, path, Some((mode, oid)))?;
            continue;
        }
        if let Some(path) = stream.take_prefixed(b"D ")? {
            tree = tree_edit(&mut engine.odb, tree, &path, None)?;
            continue;
        }
        stream.take_exact(b"")?;
        break;
    }

    if tree == EMPTY_TREE_OID {
        engine.odb.ensure_empty_tree()?;
    }
    let author = author.unwrap_or_else(|| committer.clone());
    let commit = Commit::new(tree, parents, author, committer, message);
    let oid = engine
        .odb
        .write_object(ObjectType::Commit, &commit.to_data())?;
    if let Some(mark) = mark {
        engine.marks.insert(mark, oid);
    }
    engine.set_ref(&ref_name, Some(oid))?;
    Ok(())
}

fn cmd_reset<R: BufRead>(
    engine: &mut Engine,
    stream: &mut CommandStream<R>,
    args: &[&[u8]],
) -> Result<(), BridgeError> {
    let ref_name = one_arg(args, "reset <ref>")?
        .to_str()
        .map_err(|_| BridgeError::ProtocolViolation("non-utf8 ref name".into()))?
        .to_string();
    let mut value = None;
    if let Some(token) = stream.take_prefixed(b"from ")?
        && token != NULL_HEX
    {
        value = Some(resolve_dataref(engine, &token)?);
    }
    engine.set_ref(&ref_name, value)
}

fn cmd_get_mark<W: Write>(
    engine: &mut Engine,
    output: &mut W,
    args: &[&[u8]],
) -> Result<(), BridgeError> {
    let token = one_arg(args, "get-mark :<idnum>")?;
    let mark = parse_mark(token).ok_or_else(|| {
        BridgeError::ProtocolViolation(format!("bad mark `{}`", token.as_bstr()))
    })?;
    let oid = engine
        .marks
        .get(&mark)
        .ok_or_else(|| BridgeError::ProtocolViolation(format!("unknown mark :{mark}")))?;
    writeln!(output, "{oid}")?;
    Ok(())
}

fn cmd_cat_blob<W: Write>(
    engine: &mut Engine,
    output: &mut W,
    args: &[&[u8]],
) -> Result<(), BridgeError> {
    let token = one_arg(args, "cat-blob <dataref>")?;
    let oid = resolve_dataref(engine, token)?;
    let blob = Blob::from_content(&engine.odb.read_blob(&oid)?);
    writeln!(output, "{blob}")?;
    output.write_all(&blob.data)?;
    output.write_all(b"\n")?;
    Ok(())
}

fn cmd_ls<W: Write>(
    engine: &mut Engine,
    output: &mut W,
    args: &[&[u8]],
) -> Result<(), BridgeError> {
    let [root_token, path] = args else {
        return Err(BridgeError::ProtocolViolation(
            "expected `ls <dataref> <path>`".into(),
        ));
    };
    let root = resolve_dataref(engine, root_token)?;
    let mut current = match engine.odb.object_type(&root)? {
        ObjectType::Commit => engine.odb.read_commit(&root)?.tree_id,
        _ => root,
    };
    let mut mode = TreeItemMode::Tree;
    let mut found = true;
    for component in path.split(|&b| b == b'/') {
        if component.is_empty() {
            continue;
        }
        if !mode.is_tree() {
            found = false;
            break;
        }
        let tree = engine.odb.read_tree(&current)?;
        match tree.entry(component.as_bstr()) {
            Some(item) => {
                mode = item.mode;
                current = item.oid;
            }
            None => {
                found = false;
                break;
            }
        }
    }
    if found {
        let kind = match mode {
            TreeItemMode::Tree => "tree",
            TreeItemMode::Blob | TreeItemMode::BlobExecutable | TreeItemMode::Link => "blob",
            TreeItemMode::Commit | TreeItemMode::HgFile | TreeItemMode::HgFileExecutable => {
                "commit"
            }
        };
        writeln!(
            output,
            "{} {kind} {current}\t{}",
            mode.to_padded_string(),
            path.as_bstr()
        )?;
    } else {
        writeln!(output, "missing {}", path.as_bstr())?;
    }
    Ok(())
}

fn cmd_set(engine: &mut Engine, args: &[&[u8]]) -> Result<(), BridgeError> {
    let [kind, hg_sha, value] = args else {
        return Err(BridgeError::ProtocolViolation(
            "expected `set <kind> <hg-sha> <git-ref-or-mark>`".into(),
        ));
    };
    let kind = kind.to_str().map_err(|_| {
        BridgeError::UnknownObjectKind(kind.as_bstr().to_string())
    })?;
    let node = HgOid::from_hex(hg_sha)?;
    let value = if *value == NULL_HEX {
        None
    } else {
        Some(resolve_dataref(engine, value)?)
    };
    engine.set_mapping(kind, node, value)
}

fn cmd_store<R: BufRead, W: Write>(
    engine: &mut Engine,
    stream: &mut CommandStream<R>,
    output: &mut W,
    args: &[&[u8]],
) -> Result<(), BridgeError> {
    match args {
        [b"metadata", name] => {
            let name = name.to_str().map_err(|_| {
                BridgeError::UnknownObjectKind(name.as_bstr().to_string())
            })?;
            let root = engine.flush_notes(name)?;
            writeln!(output, "{root}")?;
            Ok(())
        }
        [kind @ (b"file" | b"manifest"), delta_arg, len] => {
            let len = parse_len(len)?;
            let source = if **delta_arg == b"cg2"[..] {
                DeltaSource::Embedded
            } else {
                DeltaSource::Known(HgOid::from_hex(delta_arg)?)
            };
            let payload = stream.read_exact(len)?;
            let chunk = RevChunk::parse(Bytes::from(payload), source)?;
            if **kind == b"file"[..] {
                engine.store_file(&chunk)?;
            } else {
                engine.store_manifest(&chunk)?;
            }
            Ok(())
        }
        [b"changeset", hg_sha, len] => {
            let node = HgOid::from_hex(hg_sha)?;
            let len = parse_len(len)?;
            let payload = stream.read_exact(len)?;
            engine.store_changeset(node, &payload)?;
            Ok(())
        }
        [b"changegroup", version] => {
            let version = match *version {
                b"1" => 1,
                b"2" => 2,
                other => {
                    return Err(BridgeError::ProtocolViolation(format!(
                        "unsupported changegroup version `{}`",
                        other.as_bstr()
                    )));
                }
            };
            store_changegroup(engine, stream.inner()?, version)
        }
        [kind, ..] => Err(BridgeError::UnknownObjectKind(kind.as_bstr().to_string())),
        [] => Err(BridgeError::ProtocolViolation(
            "expected `store <kind> ...`".into(),
        )),
    }
}

fn parse_len(token: &[u8]) -> Result<usize, BridgeError> {
    token
        .to_str()
        .ok()
        .and_then(|token| token.parse().ok())
        .ok_or_else(|| {
            BridgeError::ProtocolViolation(format!("bad length `{}`", token.as_bstr()))
        })
}

/// Drive one changegroup: changesets arrive first but are stored by the
/// driver through `store changeset`, so their section is drained; manifest
/// and file sections are stored as they stream in.
fn store_changegroup<R: BufRead>(
    engine: &mut Engine,
    input: &mut R,
    version: u8,
) -> Result<(), BridgeError> {
    let mut reader = ChangegroupReader::new(input, version)?;
    while reader.next_chunk()?.is_some() {}

    let mut previous = None;
    while let Some(raw) = reader.next_chunk()? {
        let chunk = RevChunk::parse(raw, reader.delta_source(previous))?;
        previous = Some(chunk.node);
        engine.store_manifest(&chunk)?;
    }

    while let Some(name) = reader.next_chunk()? {
        debug!(file = %name.as_bstr(), "file section");
        let mut previous = None;
        while let Some(raw) = reader.next_chunk()? {
            let chunk = RevChunk::parse(raw, reader.delta_source(previous))?;
            previous = Some(chunk.node);
            engine.store_file(&chunk)?;
        }
    }
    Ok(())
}

/// Rewrite the tree at `tree_oid` with `path` set to `change` (or removed
/// when `None`), writing every touched level and returning the new root.
/// Emptied trees collapse to the canonical empty tree and are pruned from
/// their parents.
fn tree_edit(
    odb: &mut Odb,
    tree_oid: GitOid,
    path: &[u8],
    change: Option<(TreeItemMode, GitOid)>,
) -> Result<GitOid, BridgeError> {
    let components: Vec<&[u8]> = path.split(|&b| b == b'/').collect();
    if components.iter().any(|component| component.is_empty()) {
        return Err(BridgeError::ProtocolViolation(format!(
            "bad path `{}`",
            path.as_bstr()
        )));
    }
    edit_level(odb, tree_oid, &components, change)
}

fn edit_level(
    odb: &mut Odb,
    tree_oid: GitOid,
    components: &[&[u8]],
    change: Option<(TreeItemMode, GitOid)>,
) -> Result<GitOid, BridgeError> {
    let tree = odb.read_tree(&tree_oid)?;
    let mut items = tree.tree_items;
    let (head, rest) = components
        .split_first()
        .expect("tree_edit rejects empty paths");
    let position = items.iter().position(|item| item.name == *head);
    if rest.is_empty() {
        match (change, position) {
            (Some((mode, oid)), Some(idx)) => {
                items[idx].mode = mode;
                items[idx].oid = oid;
            }
            (Some((mode, oid)), None) => {
                items.push(TreeItem::new(mode, oid, BString::from(*head)))
            }
            (None, Some(idx)) => {
                items.remove(idx);
            }
            (None, None) => {}
        }
    } else {
        let sub_oid = position
            .filter(|&idx| items[idx].mode.is_tree())
            .map(|idx| items[idx].oid)
            .unwrap_or(EMPTY_TREE_OID);
        let new_sub = edit_level(odb, sub_oid, rest, change)?;
        match (new_sub == EMPTY_TREE_OID, position) {
            (true, Some(idx)) => {
                items.remove(idx);
            }
            (true, None) => {}
            (false, Some(idx)) => {
                items[idx].mode = TreeItemMode::Tree;
                items[idx].oid = new_sub;
            }
            (false, None) => {
                items.push(TreeItem::new(
                    TreeItemMode::Tree,
                    new_sub,
                    BString::from(*head),
                ));
            }
        }
    }
    if items.is_empty() {
        return Ok(EMPTY_TREE_OID);
    }
    let tree = Tree::from_tree_items(items);
    odb.write_object(ObjectType::Tree, &tree.to_data())?;
    Ok(tree.id)
}
