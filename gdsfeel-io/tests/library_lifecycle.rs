use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::TempDir;
use zip::write::SimpleFileOptions;

use gdsfeel_io::{available_libraries, library_files, Library};

const LIB_INI: &str = "[INITLIB]\ndbu=2000\nunit=UM\nname=DEMO\n";

const LAYERS_XML: &str = r#"<layers>
    <layer gdsno="1" visible="true" selectable="true">
        <color r="0.8" g="0.1" b="0.1" a="1.0"/>
    </layer>
</layers>"#;

fn boundary_structure(xmax: f64, ymax: f64) -> String {
    format!(
        r#"<structure>
            <element type="boundary" keyNumber="1" layerNumber="1">
                <vertices><xy>0 0</xy><xy>0 {ymax}</xy><xy>{xmax} {ymax}</xy><xy>{xmax} 0</xy></vertices>
            </element>
        </structure>"#
    )
}

fn sref_structure(sname: &str, x: f64, y: f64) -> String {
    format!(
        r#"<structure>
            <element type="sref" keyNumber="1" sname="{sname}" mag="1" angle="0">
                <vertices><xy>{x} {y}</xy></vertices>
            </element>
        </structure>"#
    )
}

fn build_archive(path: &Path, members: &[(&str, &str)]) {
    let file = fs::File::create(path).expect("create archive");
    let mut writer = zip::ZipWriter::new(file);
    let options = SimpleFileOptions::default();
    for (name, content) in members {
        if name.ends_with('/') {
            writer.add_directory(*name, options).expect("add directory");
        } else {
            writer.start_file(*name, options).expect("start member");
            writer.write_all(content.as_bytes()).expect("write member");
        }
    }
    writer.finish().expect("finish archive");
}

fn archive_member_names(path: &Path) -> BTreeSet<String> {
    let file = fs::File::open(path).expect("open archive");
    let archive = zip::ZipArchive::new(file).expect("read archive");
    archive.file_names().map(|name| name.to_string()).collect()
}

fn demo_members(top_generation: &str) -> Vec<(&'static str, String)> {
    vec![
        ("LIB.ini", LIB_INI.to_string()),
        ("layers.xml", LAYERS_XML.to_string()),
        ("TOP.structure/", String::new()),
        ("TOP.structure/TOP.1.gdsfeelbeta", top_generation.to_string()),
    ]
}

fn build_demo_archive(path: &Path, members: &[(&str, String)]) {
    let borrowed: Vec<(&str, &str)> = members
        .iter()
        .map(|(name, content)| (*name, content.as_str()))
        .collect();
    build_archive(path, &borrowed);
}

#[test]
fn open_populates_metadata_layers_and_structures() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("DEMO.db");
    build_demo_archive(&archive_path, &demo_members(&boundary_structure(10.0, 10.0)));

    let mut library = Library::new(&archive_path, root.path());
    assert!(library.is_closed());
    library.open().expect("open library");
    assert!(library.is_open());

    assert_eq!(library.name(), "DEMO");
    assert_eq!(library.dbu(), 2000);
    assert_eq!(library.unit(), "UM");
    assert_eq!(library.structure_names(), vec!["TOP".to_string()]);

    let color = library.color_for_layer_number(1);
    assert!((color.r - 0.8).abs() < 1e-6);

    let structure = library.structure_named("top").expect("TOP by any case");
    assert_eq!(structure.name(), "TOP");
    assert_eq!(structure.element_count(), 1);
    assert_eq!(structure.generation_numbers(), vec![1]);

    let bounds = library.structure_bounds("TOP").expect("bounds");
    assert_eq!(bounds.min().x(), 0.0);
    assert_eq!(bounds.max().x(), 10.0);
    assert_eq!(bounds.max().y(), 10.0);

    library.close().expect("close library");
    assert!(library.is_closed());
}

#[test]
fn current_generation_is_the_maximum() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("GEN.db");
    build_archive(
        &archive_path,
        &[
            ("LIB.ini", "[INITLIB]\nname=GEN\n"),
            ("TOP.structure/", ""),
            ("TOP.structure/TOP.1.gdsfeelbeta", &boundary_structure(10.0, 10.0)),
            ("TOP.structure/TOP.3.gdsfeelbeta", &boundary_structure(20.0, 20.0)),
        ],
    );

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    let structure = library.structure_named("TOP").expect("TOP");
    assert_eq!(structure.generation_numbers(), vec![1, 3]);

    let bounds = library.structure_bounds("TOP").expect("bounds");
    assert_eq!(bounds.max().x(), 20.0);
    library.close().expect("close library");
}

#[test]
fn structure_without_generation_files_has_zero_elements() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("EMPTY.db");
    build_archive(
        &archive_path,
        &[("LIB.ini", "[INITLIB]\nname=EMPTY\n"), ("BARE.structure/", "")],
    );

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    let structure = library.structure_named("BARE").expect("BARE");
    assert_eq!(structure.element_count(), 0);
    assert!(library.structure_bounds("BARE").expect("bounds").is_empty());
    library.close().expect("close library");
}

#[test]
fn load_is_idempotent_and_does_not_reparse() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("ONCE.db");
    build_demo_archive(&archive_path, &demo_members(&boundary_structure(10.0, 10.0)));

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    let working = library.working_dir();
    {
        let structure = library.structure_named("TOP").expect("TOP");
        assert_eq!(structure.element_count(), 1);
    }

    // a newer generation appearing after the first parse is not picked up
    fs::write(
        working.join("TOP.structure/TOP.9.gdsfeelbeta"),
        sref_structure("OTHER", 0.0, 0.0) + &boundary_structure(99.0, 99.0),
    )
    .expect("write extra generation");

    let structure = library.structure_named("TOP").expect("TOP");
    assert_eq!(structure.element_count(), 1);
    library.close().expect("close library");
}

#[test]
fn sref_bounds_map_referenced_structure() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("REF.db");
    build_archive(
        &archive_path,
        &[
            ("LIB.ini", "[INITLIB]\nname=REF\n"),
            ("TOP.structure/", ""),
            ("TOP.structure/TOP.1.gdsfeelbeta", &sref_structure("SUB", 100.0, 50.0)),
            ("SUB.structure/", ""),
            ("SUB.structure/SUB.1.gdsfeelbeta", &boundary_structure(10.0, 10.0)),
        ],
    );

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    let bounds = library.structure_bounds("TOP").expect("bounds");
    assert_eq!(bounds.min().x(), 100.0);
    assert_eq!(bounds.min().y(), 50.0);
    assert_eq!(bounds.max().x(), 110.0);
    assert_eq!(bounds.max().y(), 60.0);
    library.close().expect("close library");
}

#[test]
fn unresolved_reference_contributes_no_geometry() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("MISS.db");
    build_archive(
        &archive_path,
        &[
            ("LIB.ini", "[INITLIB]\nname=MISS\n"),
            ("TOP.structure/", ""),
            ("TOP.structure/TOP.1.gdsfeelbeta", &sref_structure("NOPE", 0.0, 0.0)),
        ],
    );

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    let bounds = library.structure_bounds("TOP").expect("bounds");
    assert!(bounds.is_empty());
    library.close().expect("close library");
}

#[test]
fn cyclic_references_terminate() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("CYCLE.db");
    let b_generation = r#"<structure>
            <element type="boundary" layerNumber="1">
                <vertices><xy>0 0</xy><xy>0 10</xy><xy>10 10</xy><xy>10 0</xy></vertices>
            </element>
            <element type="sref" sname="A">
                <vertices><xy>0 0</xy></vertices>
            </element>
        </structure>"#;
    build_archive(
        &archive_path,
        &[
            ("LIB.ini", "[INITLIB]\nname=CYCLE\n"),
            ("A.structure/", ""),
            ("A.structure/A.1.gdsfeelbeta", &sref_structure("B", 0.0, 0.0)),
            ("B.structure/", ""),
            ("B.structure/B.1.gdsfeelbeta", b_generation),
        ],
    );

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    // A -> B -> A: the back edge yields no geometry, B's boundary survives
    let bounds = library.structure_bounds("A").expect("bounds");
    assert!(!bounds.is_empty());
    assert_eq!(bounds.max().x(), 10.0);
    assert_eq!(bounds.max().y(), 10.0);
    library.close().expect("close library");
}

#[test]
fn close_round_trips_the_member_set() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("RT.db");
    build_demo_archive(&archive_path, &demo_members(&boundary_structure(10.0, 10.0)));
    let original = archive_member_names(&archive_path);

    let mut library = Library::new(&archive_path, root.path());
    library.open().expect("open library");
    let working = library.working_dir();
    library.close().expect("close library");

    assert_eq!(archive_member_names(&archive_path), original);
    assert!(!working.exists());
}

#[test]
fn open_and_close_are_idempotent() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("IDEM.db");
    build_demo_archive(&archive_path, &demo_members(&boundary_structure(10.0, 10.0)));

    let mut library = Library::new(&archive_path, root.path());
    library.close().expect("close on closed is a no-op");
    library.open().expect("open library");
    library.open().expect("open on open is a no-op");
    library.close().expect("close library");
    library.close().expect("close on closed is a no-op");
}

#[test]
fn accessors_auto_open_a_closed_library() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("AUTO.db");
    build_demo_archive(&archive_path, &demo_members(&boundary_structure(10.0, 10.0)));

    let mut library = Library::new(&archive_path, root.path());
    assert!(library.is_closed());
    assert!(library.structure_named("TOP").is_some());
    assert!(library.is_open());
    library.close().expect("close library");
}

#[test]
fn discovery_filters_on_metadata_member() {
    let root = TempDir::new().expect("temp root");
    build_archive(
        &root.path().join("GOOD.db"),
        &[("LIB.ini", "[INITLIB]\nname=GOOD\n")],
    );
    build_archive(&root.path().join("BAD.db"), &[("readme.txt", "not a library")]);
    build_archive(
        &root.path().join("UPPER.DB"),
        &[("LIB.ini", "[INITLIB]\nname=UPPER\n")],
    );
    fs::write(root.path().join("note.txt"), "ignored").expect("write note");

    let files = library_files(root.path());
    let names: Vec<_> = files
        .iter()
        .filter_map(|path| path.file_name().and_then(|name| name.to_str()))
        .collect();
    assert_eq!(names, vec!["GOOD.db", "UPPER.DB"]);

    let libraries = available_libraries(root.path());
    assert_eq!(libraries.len(), 2);
    assert!(libraries.iter().all(|library| library.is_closed()));
}

#[test]
fn extraction_failure_leaves_no_working_tree() {
    let root = TempDir::new().expect("temp root");
    let archive_path = root.path().join("CORRUPT.db");
    fs::write(&archive_path, b"this is not a zip archive").expect("write junk");

    let mut library = Library::new(&archive_path, root.path());
    assert!(library.open().is_err());
    assert!(library.is_closed());
    assert!(!library.working_dir().exists());
}
