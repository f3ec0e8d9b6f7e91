use std::cell::{Ref, RefCell};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use gdsfeel_core::element::{
    Aref, ArrayShape, Boundary, Element, Path as PathElement, ReferenceResolver, Sref,
};
use gdsfeel_core::geometry::{DataBounds, PathEnd, Point2};
use gdsfeel_core::layer::{Color, LayerTable};

/// 归档内的元数据文件名。缺少该成员的 zip 不是合法库文件。
pub const LIBRARY_META_FILENAME: &str = "LIB.ini";
/// 归档内的图层属性文件名，可选。
pub const LAYERS_FILENAME: &str = "layers.xml";
/// 工程根目录下的解压工作区目录名。
pub const EXTRACT_AREA_DIRNAME: &str = ".editlibs";

const STRUCTURE_DIR_SUFFIX: &str = "structure";
const GENERATION_EXTENSION: &str = "gdsfeelbeta";
const ARCHIVE_EXTENSION: &str = "db";

const DEFAULT_DBU: i32 = 1000;
const DEFAULT_UNIT: &str = "MM";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("archive failure on {path:?}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("failed to walk working tree {path:?}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error("working tree still present after close: {path:?}")]
    WorkingTreeNotRemoved { path: PathBuf },
}

/// 工程根下的解压工作区路径。
pub fn extract_area(project_root: &Path) -> PathBuf {
    project_root.join(EXTRACT_AREA_DIRNAME)
}

// ---------------------------------------------------------------------------
// LIB.ini

#[derive(Debug, Clone, PartialEq)]
struct LibraryMeta {
    dbu: i32,
    unit: String,
    name: Option<String>,
}

impl Default for LibraryMeta {
    fn default() -> Self {
        Self {
            dbu: DEFAULT_DBU,
            unit: DEFAULT_UNIT.to_string(),
            name: None,
        }
    }
}

/// 手写的 INI 读取器，只认 `[INITLIB]` 段。未知键忽略，坏行跳过。
fn parse_library_meta(content: &str) -> LibraryMeta {
    let mut meta = LibraryMeta::default();
    let mut in_section = false;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') {
            in_section = line.eq_ignore_ascii_case("[INITLIB]");
            continue;
        }
        if !in_section {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            debug!(line, "skipping malformed metadata line");
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        match key {
            "dbu" => match value.parse::<i32>() {
                Ok(dbu) => meta.dbu = dbu,
                Err(_) => warn!(value, "invalid dbu in library metadata, keeping default"),
            },
            "unit" => meta.unit = value.to_string(),
            "name" => meta.name = Some(value.to_string()),
            _ => {}
        }
    }
    meta
}

// ---------------------------------------------------------------------------
// XML 解析

fn child_element<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    tag: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children()
        .filter(|child| child.is_element())
        .find(|child| child.has_tag_name(tag))
}

fn attr_i32(node: roxmltree::Node, name: &str, default: i32) -> i32 {
    match node.attribute(name) {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!(attribute = name, value, "invalid integer attribute, using default");
            default
        }),
        None => default,
    }
}

fn attr_f64(node: roxmltree::Node, name: &str, default: f64) -> f64 {
    match node.attribute(name) {
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            warn!(attribute = name, value, "invalid numeric attribute, using default");
            default
        }),
        None => default,
    }
}

fn attr_bool(node: roxmltree::Node, name: &str, default: bool) -> bool {
    match node.attribute(name) {
        Some(value) => value.trim().eq_ignore_ascii_case("true"),
        None => default,
    }
}

fn parse_vertices(node: roxmltree::Node) -> Vec<Point2> {
    let Some(vertices_node) = child_element(node, "vertices") else {
        return Vec::new();
    };
    let mut vertices = Vec::new();
    for xy in vertices_node.children().filter(|child| child.is_element()) {
        if !xy.has_tag_name("xy") {
            continue;
        }
        let text = xy.text().unwrap_or("");
        let mut fields = text.split_whitespace();
        let parsed = fields
            .next()
            .and_then(|x| x.parse::<f64>().ok())
            .zip(fields.next().and_then(|y| y.parse::<f64>().ok()));
        match parsed {
            Some((x, y)) => vertices.push(Point2::new(x, y)),
            None => warn!(text, "invalid <xy> coordinate pair, skipped"),
        }
    }
    vertices
}

/// 由 `<element type=..>` 节点构造元素。未知类型记录日志并跳过。
fn element_from_node(node: roxmltree::Node) -> Option<Element> {
    let type_tag = node.attribute("type").unwrap_or("");
    let vertices = parse_vertices(node);
    let mut element = match type_tag {
        "boundary" => Element::Boundary(Boundary::new(
            vertices,
            attr_i32(node, "layerNumber", 0),
            attr_i32(node, "datatype", 0),
        )),
        "path" => Element::Path(PathElement::new(
            vertices,
            attr_f64(node, "width", 0.0),
            PathEnd::from_code(attr_i32(node, "pathtype", 0)),
            attr_i32(node, "layerNumber", 0),
            attr_i32(node, "datatype", 0),
        )),
        "sref" => {
            let mut sref = Sref::new(vertices, node.attribute("sname").unwrap_or(""));
            sref.set_placement(
                attr_f64(node, "mag", 1.0),
                attr_f64(node, "angle", 0.0),
                attr_bool(node, "reflected", false),
            );
            Element::Sref(sref)
        }
        "aref" => {
            let shape = match child_element(node, "ashape") {
                Some(ashape) => {
                    let rows = attr_i32(ashape, "rows", 1);
                    let cols = attr_i32(ashape, "cols", 1);
                    let shape = ArrayShape::checked(
                        rows,
                        cols,
                        attr_f64(ashape, "row-spacing", 0.0),
                        attr_f64(ashape, "column-spacing", 0.0),
                    );
                    if shape.is_none() {
                        warn!(rows, cols, "array counts below 1, aref has no cells");
                    }
                    shape
                }
                None => {
                    warn!("aref without <ashape> descriptor has no cells");
                    None
                }
            };
            let mut aref = Aref::new(vertices, node.attribute("sname").unwrap_or(""), shape);
            aref.set_placement(
                attr_f64(node, "mag", 1.0),
                attr_f64(node, "angle", 0.0),
                attr_bool(node, "reflected", false),
            );
            Element::Aref(aref)
        }
        unknown => {
            warn!(tag = unknown, "unknown element type tag, skipped");
            return None;
        }
    };
    element.set_key_number(attr_i32(node, "keyNumber", 0));
    Some(element)
}

fn parse_generation_content(content: &str) -> Vec<Element> {
    let document = match roxmltree::Document::parse(content) {
        Ok(document) => document,
        Err(err) => {
            warn!(error = %err, "malformed generation file, structure has no elements");
            return Vec::new();
        }
    };
    let mut elements = Vec::new();
    for node in document
        .root_element()
        .children()
        .filter(|child| child.is_element())
    {
        if !node.has_tag_name("element") {
            warn!(tag = node.tag_name().name(), "unexpected node in generation file, skipped");
            continue;
        }
        if let Some(element) = element_from_node(node) {
            elements.push(element);
        }
    }
    elements
}

/// 解析 layers.xml。每个 `<layer>` 节点先重置为默认再套用属性；
/// `<color>` 缺失或残缺时保持默认并告警。
fn layer_table_from_xml(content: &str) -> Option<LayerTable> {
    let document = match roxmltree::Document::parse(content) {
        Ok(document) => document,
        Err(err) => {
            warn!(error = %err, "malformed layer file, ignored");
            return None;
        }
    };
    let mut table = LayerTable::new();
    for node in document
        .root_element()
        .children()
        .filter(|child| child.is_element())
    {
        if !node.has_tag_name("layer") {
            continue;
        }
        let Some(number) = node.attribute("gdsno").and_then(|v| v.trim().parse().ok()) else {
            warn!("layer node without valid gdsno, skipped");
            continue;
        };
        let layer = table.at_number(number);
        layer.reset_to_default();
        layer.visible = attr_bool(node, "visible", true);
        layer.selectable = attr_bool(node, "selectable", true);
        match child_element(node, "color") {
            Some(color) => {
                let components = color
                    .attribute("r")
                    .and_then(|r| r.trim().parse::<f32>().ok())
                    .zip(color.attribute("g").and_then(|g| g.trim().parse::<f32>().ok()))
                    .zip(color.attribute("b").and_then(|b| b.trim().parse::<f32>().ok()));
                match components {
                    Some(((r, g), b)) => {
                        let a = color
                            .attribute("a")
                            .and_then(|a| a.trim().parse::<f32>().ok())
                            .unwrap_or(1.0);
                        layer.color = Color::new(r, g, b, a);
                    }
                    None => warn!(number, "incomplete <color> node, layer keeps defaults"),
                }
            }
            None => warn!(number, "layer without <color> node, keeps defaults"),
        }
    }
    Some(table)
}

// ---------------------------------------------------------------------------
// Structure

#[derive(Debug, Default)]
struct StructureState {
    loaded: bool,
    dirty: bool,
    elements: Vec<Element>,
    data_bounds: Option<DataBounds>,
}

/// 命名单元。以 `<NAME>.structure` 目录为后备存储，世代文件
/// `<NAME>.<gen>.gdsfeelbeta` 中世代号最大者为当前版本。
/// 元素在首次查询时惰性解析一次。
#[derive(Debug)]
pub struct Structure {
    name: String,
    dir: PathBuf,
    state: RefCell<StructureState>,
}

impl Structure {
    /// 目录名形如 `NAME.structure` 时构造结构，名称归一化为大写。
    pub fn from_directory(dir: &Path) -> Option<Self> {
        let file_name = dir.file_name()?.to_str()?;
        let (stem, suffix) = file_name.rsplit_once('.')?;
        if suffix != STRUCTURE_DIR_SUFFIX || stem.is_empty() {
            return None;
        }
        Some(Self {
            name: stem.to_uppercase(),
            dir: dir.to_path_buf(),
            state: RefCell::new(StructureState::default()),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn is_dirty(&self) -> bool {
        self.state.borrow().dirty
    }

    pub fn mark_dirty(&self) {
        self.state.borrow_mut().dirty = true;
    }

    /// 磁盘上的 (世代号, 文件路径) 列表，未排序。
    fn generation_entries(&self) -> Vec<(i32, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut generations = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            let fields: Vec<&str> = file_name.split('.').collect();
            if fields.len() != 3 || fields[2] != GENERATION_EXTENSION {
                continue;
            }
            let Ok(generation) = fields[1].parse::<i32>() else {
                debug!(file = file_name, "non-numeric generation field, ignored");
                continue;
            };
            generations.push((generation, path));
        }
        generations
    }

    /// 升序排列的世代号。
    pub fn generation_numbers(&self) -> Vec<i32> {
        let mut numbers: Vec<i32> = self
            .generation_entries()
            .into_iter()
            .map(|(generation, _)| generation)
            .collect();
        numbers.sort_unstable();
        numbers
    }

    /// 当前世代文件，即世代号最大者。没有世代文件时为 None。
    pub fn current_generation_file(&self) -> Option<PathBuf> {
        self.generation_entries()
            .into_iter()
            .max_by_key(|(generation, _)| *generation)
            .map(|(_, path)| path)
    }

    /// 幂等加载：只在首次调用时解析当前世代文件。解析失败降级为
    /// 零元素并记录日志，绝不向调用方传播。
    pub fn load(&self) {
        if self.state.borrow().loaded {
            return;
        }
        let elements = match self.current_generation_file() {
            Some(path) => match fs::read_to_string(&path) {
                Ok(content) => parse_generation_content(&content),
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to read generation file, structure has no elements"
                    );
                    Vec::new()
                }
            },
            None => {
                debug!(structure = %self.name, "no generation file, zero elements");
                Vec::new()
            }
        };
        let mut state = self.state.borrow_mut();
        if state.loaded {
            return;
        }
        state.elements = elements;
        state.loaded = true;
    }

    /// 解析顺序的元素序列。触发惰性加载。
    pub fn elements(&self) -> Ref<'_, [Element]> {
        self.load();
        Ref::map(self.state.borrow(), |state| state.elements.as_slice())
    }

    pub fn element_count(&self) -> usize {
        self.elements().len()
    }

    /// 全体元素的聚合包围盒，带缓存。空包围盒的元素被跳过，
    /// 出错的元素降级为无几何并告警。
    pub fn data_bounds(&self, resolver: &dyn ReferenceResolver) -> DataBounds {
        self.load();
        if let Some(cached) = self.state.borrow().data_bounds {
            return cached;
        }
        let mut bounds = DataBounds::reset();
        {
            let state = self.state.borrow();
            for element in &state.elements {
                match element.data_bounds(resolver) {
                    Ok(element_bounds) => bounds.include_bounds(&element_bounds),
                    Err(err) => warn!(
                        structure = %self.name,
                        key_number = element.key_number(),
                        error = %err,
                        "element geometry failed, skipped in structure bounds"
                    ),
                }
            }
        }
        // 自引用解析期间共享借用仍活跃，此时放弃写缓存
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.data_bounds = Some(bounds);
        }
        bounds
    }
}

// ---------------------------------------------------------------------------
// Library

struct WorkingTreeGuard<'a> {
    path: &'a Path,
}

impl Drop for WorkingTreeGuard<'_> {
    fn drop(&mut self) {
        if self.path.exists() {
            if let Err(err) = fs::remove_dir_all(self.path) {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove working tree"
                );
            }
        }
    }
}

/// 版图库。一个 zip 归档对应一个库；`open()` 解压到工作区并装载
/// 元数据、图层与结构清单，`close()` 回打包并移除工作树。
///
/// 自动打开的访问器要求 `&mut self`；当库正以 `&dyn
/// ReferenceResolver` 形式被几何查询借用时，使用共享访问器
/// [`Library::structure`]，前提是库已显式打开。
#[derive(Debug)]
pub struct Library {
    archive_path: PathBuf,
    extract_root: PathBuf,
    name: String,
    unit: String,
    dbu: i32,
    layers: LayerTable,
    structures: BTreeMap<String, Structure>,
    resolving: RefCell<Vec<String>>,
}

impl Library {
    /// 由归档路径与工程根目录构造，不做任何 I/O。
    pub fn new(archive_path: impl Into<PathBuf>, project_root: impl AsRef<Path>) -> Self {
        let archive_path = archive_path.into();
        let name = archive_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("")
            .to_uppercase();
        Self {
            archive_path,
            extract_root: extract_area(project_root.as_ref()),
            name,
            unit: DEFAULT_UNIT.to_string(),
            dbu: DEFAULT_DBU,
            layers: LayerTable::new(),
            structures: BTreeMap::new(),
            resolving: RefCell::new(Vec::new()),
        }
    }

    #[inline]
    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    #[inline]
    pub fn dbu(&self) -> i32 {
        self.dbu
    }

    /// 库的解压工作目录，以归档文件全名命名。
    pub fn working_dir(&self) -> PathBuf {
        let file_name = self
            .archive_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        self.extract_root.join(file_name)
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.working_dir().is_dir()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// 解压归档、装载元数据与图层、枚举结构目录。已打开时记录
    /// 日志并直接返回。解压失败不留部分工作树。
    pub fn open(&mut self) -> Result<(), ArchiveError> {
        if self.is_open() {
            debug!(library = %self.name, "open() on an open library is a no-op");
            return Ok(());
        }
        let working = self.working_dir();
        fs::create_dir_all(&working).map_err(|source| ArchiveError::Write {
            path: working.clone(),
            source,
        })?;
        if let Err(err) = self.extract_archive(&working) {
            if let Err(remove_err) = fs::remove_dir_all(&working) {
                warn!(
                    path = %working.display(),
                    error = %remove_err,
                    "failed to clean partial extraction"
                );
            }
            return Err(err);
        }
        self.load_metadata(&working);
        self.load_layers(&working);
        self.enumerate_structures(&working);
        debug!(
            library = %self.name,
            structures = self.structures.len(),
            "library opened"
        );
        Ok(())
    }

    /// 把工作树打包回归档并移除工作树。已关闭时记录日志并直接
    /// 返回。打包写入临时文件后原子改名覆盖原归档；无论打包成败，
    /// 工作树都会被移除并验证。
    pub fn close(&mut self) -> Result<(), ArchiveError> {
        if self.is_closed() {
            debug!(library = %self.name, "close() on a closed library is a no-op");
            return Ok(());
        }
        let working = self.working_dir();
        let pack_result = {
            let _guard = WorkingTreeGuard { path: &working };
            self.pack_archive(&working)
        };
        self.structures.clear();
        pack_result?;
        if working.exists() {
            return Err(ArchiveError::WorkingTreeNotRemoved { path: working });
        }
        Ok(())
    }

    fn extract_archive(&self, working: &Path) -> Result<(), ArchiveError> {
        let zip_error = |source| ArchiveError::Zip {
            path: self.archive_path.clone(),
            source,
        };
        let file = fs::File::open(&self.archive_path).map_err(|source| ArchiveError::Read {
            path: self.archive_path.clone(),
            source,
        })?;
        let mut archive = zip::ZipArchive::new(file).map_err(zip_error)?;
        for index in 0..archive.len() {
            let mut member = archive.by_index(index).map_err(zip_error)?;
            let target = working.join(member.name());
            if member.name().ends_with('/') {
                fs::create_dir_all(&target).map_err(|source| ArchiveError::Write {
                    path: target.clone(),
                    source,
                })?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(|source| ArchiveError::Write {
                        path: parent.to_path_buf(),
                        source,
                    })?;
                }
                let mut out = fs::File::create(&target).map_err(|source| ArchiveError::Write {
                    path: target.clone(),
                    source,
                })?;
                io::copy(&mut member, &mut out).map_err(|source| ArchiveError::Write {
                    path: target.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }

    fn pack_archive(&self, working: &Path) -> Result<(), ArchiveError> {
        let mut tmp_path = self.archive_path.clone();
        tmp_path.as_mut_os_string().push(".tmp");
        let result = self.write_archive(working, &tmp_path);
        match result {
            Ok(()) => fs::rename(&tmp_path, &self.archive_path).map_err(|source| {
                ArchiveError::Write {
                    path: self.archive_path.clone(),
                    source,
                }
            }),
            Err(err) => {
                if tmp_path.exists() {
                    let _ = fs::remove_file(&tmp_path);
                }
                Err(err)
            }
        }
    }

    fn write_archive(&self, working: &Path, target: &Path) -> Result<(), ArchiveError> {
        let zip_error = |source| ArchiveError::Zip {
            path: target.to_path_buf(),
            source,
        };
        let file = fs::File::create(target).map_err(|source| ArchiveError::Write {
            path: target.to_path_buf(),
            source,
        })?;
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for entry in walkdir::WalkDir::new(working) {
            let entry = entry.map_err(|source| ArchiveError::Walk {
                path: working.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path == working {
                continue;
            }
            let relative = path.strip_prefix(working).unwrap_or(path);
            let member_name = relative.to_string_lossy().replace('\\', "/");
            if path.is_dir() {
                writer.add_directory(member_name, options).map_err(zip_error)?;
            } else {
                writer.start_file(member_name, options).map_err(zip_error)?;
                let mut input = fs::File::open(path).map_err(|source| ArchiveError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                io::copy(&mut input, &mut writer).map_err(|source| ArchiveError::Write {
                    path: target.to_path_buf(),
                    source,
                })?;
            }
        }
        writer.finish().map_err(zip_error)?;
        Ok(())
    }

    fn load_metadata(&mut self, working: &Path) {
        let meta_path = working.join(LIBRARY_META_FILENAME);
        let meta = match fs::read_to_string(&meta_path) {
            Ok(content) => parse_library_meta(&content),
            Err(_) => {
                debug!(library = %self.name, "no metadata file, using defaults");
                LibraryMeta::default()
            }
        };
        self.dbu = meta.dbu;
        self.unit = meta.unit;
        if let Some(declared) = meta.name {
            let declared = declared.to_uppercase();
            if declared != self.name {
                warn!(
                    declared = %declared,
                    derived = %self.name,
                    "declared library name differs from archive name"
                );
            }
            self.name = declared;
        }
    }

    fn load_layers(&mut self, working: &Path) {
        let layers_path = working.join(LAYERS_FILENAME);
        match fs::read_to_string(&layers_path) {
            Ok(content) => {
                if let Some(table) = layer_table_from_xml(&content) {
                    self.layers = table;
                }
            }
            Err(_) => debug!(library = %self.name, "no layer file"),
        }
    }

    fn enumerate_structures(&mut self, working: &Path) {
        self.structures.clear();
        for entry in walkdir::WalkDir::new(working)
            .into_iter()
            .filter_map(|entry| entry.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(structure) = Structure::from_directory(entry.path()) else {
                continue;
            };
            // 同名目录后注册者覆盖先注册者
            if let Some(previous) = self
                .structures
                .insert(structure.name().to_string(), structure)
            {
                warn!(
                    structure = %previous.name(),
                    "duplicate structure name, later directory wins"
                );
            }
        }
    }

    fn ensure_open(&mut self) {
        if self.is_closed() {
            if let Err(err) = self.open() {
                warn!(library = %self.name, error = %err, "auto-open failed");
            }
        }
    }

    /// 共享查询，不自动打开。未打开的库中自然查不到任何结构。
    pub fn structure(&self, name: &str) -> Option<&Structure> {
        self.structures.get(&name.to_uppercase())
    }

    /// 按名称查找结构，关闭状态下先自动打开。
    pub fn structure_named(&mut self, name: &str) -> Option<&Structure> {
        self.ensure_open();
        self.structure(name)
    }

    pub fn structures(&mut self) -> Vec<&Structure> {
        self.ensure_open();
        self.structures.values().collect()
    }

    /// 升序排列的结构名。
    pub fn structure_names(&mut self) -> Vec<String> {
        self.ensure_open();
        self.structures.keys().cloned().collect()
    }

    /// 结构的聚合包围盒，经循环防护解析引用。未知名称返回 None。
    pub fn structure_bounds(&mut self, name: &str) -> Option<DataBounds> {
        self.ensure_open();
        let this = &*self;
        let structure = this.structure(name)?;
        this.resolve_bounds_guarded(structure)
    }

    pub fn color_for_layer_number(&mut self, number: i32) -> Color {
        self.layers.at_number(number).color
    }

    #[inline]
    pub fn layers(&self) -> &LayerTable {
        &self.layers
    }

    /// 带循环防护的包围盒求值：同名结构在解析栈上时直接放弃。
    fn resolve_bounds_guarded(&self, structure: &Structure) -> Option<DataBounds> {
        let name = structure.name();
        if self.resolving.borrow().iter().any(|active| active == name) {
            warn!(structure = %name, "cyclic structure reference, yielding no geometry");
            return None;
        }
        self.resolving.borrow_mut().push(name.to_string());
        let bounds = structure.data_bounds(self);
        self.resolving.borrow_mut().pop();
        Some(bounds)
    }
}

impl ReferenceResolver for Library {
    fn reference_bounds(&self, name: &str) -> Option<DataBounds> {
        let Some(structure) = self.structure(name) else {
            warn!(structure = %name, "unresolved structure reference");
            return None;
        };
        let bounds = self.resolve_bounds_guarded(structure)?;
        if bounds.is_empty() {
            debug!(structure = %name, "referenced structure has no geometry");
            return None;
        }
        Some(bounds)
    }
}

// ---------------------------------------------------------------------------
// 发现

/// 扫描目录下扩展名为 `db`（不分大小写）且包含元数据成员的 zip
/// 文件。不合规的归档被静默跳过。返回路径升序。
pub fn library_files(root: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let has_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION));
        if !has_extension {
            continue;
        }
        let Ok(file) = fs::File::open(&path) else {
            continue;
        };
        let Ok(archive) = zip::ZipArchive::new(file) else {
            debug!(path = %path.display(), "not a readable archive, skipped");
            continue;
        };
        if archive.file_names().any(|name| name == LIBRARY_META_FILENAME) {
            files.push(path);
        } else {
            debug!(path = %path.display(), "archive lacks metadata member, skipped");
        }
    }
    files.sort();
    files
}

/// 目录下全部可用库（未打开状态）。
pub fn available_libraries(root: &Path) -> Vec<Library> {
    library_files(root)
        .into_iter()
        .map(|path| Library::new(path, root))
        .collect()
}
