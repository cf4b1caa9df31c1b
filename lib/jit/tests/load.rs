//! End-to-end loads of synthetic x86-64 ELF objects.

use kiln_jit::{
    get_jit_function_by_address, load_module, unload_module, FunctionBinding, JitFunction,
    LoadError, LoadedModule,
};
use object::write::{Object, Relocation, StandardSection, Symbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, RelocationEncoding, RelocationKind, SymbolFlags,
    SymbolKind, SymbolScope,
};
use std::collections::HashMap;
use std::sync::Arc;

fn new_object() -> Object<'static> {
    Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little)
}

fn add_function(object: &mut Object<'_>, name: &str, code: &[u8]) {
    let text = object.section_id(StandardSection::Text);
    let offset = object.append_section_data(text, code, 16);
    object.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
}

fn add_data(object: &mut Object<'_>, name: &str, data: &[u8]) {
    let section = object.section_id(StandardSection::Data);
    let offset = object.append_section_data(section, data, 8);
    object.add_symbol(Symbol {
        name: name.as_bytes().to_vec(),
        value: offset,
        size: data.len() as u64,
        kind: SymbolKind::Data,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(section),
        flags: SymbolFlags::None,
    });
}

/// `mov eax, <value>; ret`, padded with int3 to `num_bytes`.
fn return_constant_code(value: i32, num_bytes: usize) -> Vec<u8> {
    let mut code = vec![0xb8];
    code.extend_from_slice(&value.to_le_bytes());
    code.push(0xc3);
    assert!(code.len() <= num_bytes);
    code.resize(num_bytes, 0xcc);
    code
}

fn load_simple(
    object: Object<'_>,
    num_function_defs: usize,
    imports: &[FunctionBinding],
) -> Result<(Arc<LoadedModule>, Vec<Arc<JitFunction>>), LoadError> {
    let bytes = object.write().expect("failed to emit test object");
    load_module(
        &bytes,
        &HashMap::new(),
        imports,
        num_function_defs,
        &[],
        &[],
        &[],
        &[],
        None,
        None,
    )
}

#[test]
fn address_lookup_covers_exactly_the_function() {
    let mut object = new_object();
    add_function(&mut object, "functionDef0", &return_constant_code(42, 100));
    add_data(&mut object, "moduleData", &[0u8; 8]);

    let (module, function_defs) = load_simple(object, 1, &[]).unwrap();
    let function = &function_defs[0];
    assert_eq!(function.name(), "functionDef0");
    assert_eq!(function.num_bytes(), 100);

    let base = function.base_address();
    let hit = get_jit_function_by_address(base).expect("base address must resolve");
    assert!(Arc::ptr_eq(&hit, function));
    let hit = get_jit_function_by_address(base + 99).expect("last byte must resolve");
    assert!(Arc::ptr_eq(&hit, function));
    // One past the last byte is not part of the function.
    assert!(get_jit_function_by_address(base + 100).is_none());

    unload_module(&module);
}

#[test]
fn lookups_distinguish_two_live_modules() {
    let mut first = new_object();
    add_function(&mut first, "functionDef0", &return_constant_code(1, 64));
    let mut second = new_object();
    add_function(&mut second, "functionDef0", &return_constant_code(2, 64));

    let (first_module, first_defs) = load_simple(first, 1, &[]).unwrap();
    let (second_module, second_defs) = load_simple(second, 1, &[]).unwrap();
    assert_ne!(first_module.image_base(), second_module.image_base());

    let hit = get_jit_function_by_address(first_defs[0].base_address()).unwrap();
    assert!(Arc::ptr_eq(&hit, &first_defs[0]));
    let hit = get_jit_function_by_address(second_defs[0].base_address() + 63).unwrap();
    assert!(Arc::ptr_eq(&hit, &second_defs[0]));

    // The last image byte lies in code-section padding: inside the image,
    // but owned by no function.
    for module in [&first_module, &second_module] {
        let probe = module.image_base() + module.image_num_bytes() - 1;
        assert!(get_jit_function_by_address(probe).is_none());
    }

    unload_module(&first_module);
    unload_module(&second_module);
}

#[test]
fn unknown_import_fails_the_load() {
    let mut object = new_object();
    // call rel32 to an import that the caller does not bind.
    let mut code = vec![0xe8, 0, 0, 0, 0, 0xc3];
    code.resize(16, 0xcc);
    add_function(&mut object, "functionDef0", &code);
    let import = object.add_symbol(Symbol {
        name: b"functionImport7".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Unknown,
        scope: SymbolScope::Unknown,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    let text = object.section_id(StandardSection::Text);
    object
        .add_relocation(
            text,
            Relocation {
                offset: 1,
                size: 32,
                kind: RelocationKind::Relative,
                encoding: RelocationEncoding::Generic,
                symbol: import,
                addend: -4,
            },
        )
        .unwrap();

    let error = load_simple(object, 1, &[]).unwrap_err();
    match error {
        LoadError::UnresolvedSymbol(name) => assert_eq!(name, "functionImport7"),
        other => panic!("expected UnresolvedSymbol, got {other}"),
    }
}

#[test]
fn missing_function_def_fails_and_unpublishes() {
    let mut object = new_object();
    add_function(&mut object, "helperThunk", &return_constant_code(9, 32));

    let error = load_simple(object, 1, &[]).unwrap_err();
    assert!(matches!(error, LoadError::MissingFunctionDef(ref name) if name == "functionDef0"));
}

#[test]
fn unloaded_modules_vanish_from_the_index() {
    let mut object = new_object();
    add_function(&mut object, "functionDef0", &return_constant_code(3, 48));

    let (module, function_defs) = load_simple(object, 1, &[]).unwrap();
    let base = function_defs[0].base_address();
    assert!(get_jit_function_by_address(base).is_some());

    unload_module(&module);
    assert!(get_jit_function_by_address(base).is_none());
    // The handle itself outlives the index entry.
    assert_eq!(function_defs[0].num_bytes(), 48);
}

#[cfg(target_arch = "x86_64")]
mod execution {
    use super::*;

    #[test]
    fn loaded_code_executes_after_finalize() {
        let mut object = new_object();
        add_function(&mut object, "functionDef0", &return_constant_code(1234, 32));

        let (module, function_defs) = load_simple(object, 1, &[]).unwrap();
        let entry: extern "C" fn() -> i32 =
            unsafe { std::mem::transmute(function_defs[0].base_address()) };
        assert_eq!(entry(), 1234);
        unload_module(&module);
    }

    extern "C" fn host_forty_two() -> i32 {
        42
    }

    #[test]
    fn absolute_relocations_bind_function_imports() {
        let mut object = new_object();
        // mov rax, imm64; call rax; ret. The imm64 carries an 8-byte
        // absolute relocation against functionImport0.
        let mut code = vec![0x48, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0xff, 0xd0, 0xc3];
        code.resize(16, 0xcc);
        add_function(&mut object, "functionDef0", &code);
        let import = object.add_symbol(Symbol {
            name: b"functionImport0".to_vec(),
            value: 0,
            size: 0,
            kind: SymbolKind::Unknown,
            scope: SymbolScope::Unknown,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        let text = object.section_id(StandardSection::Text);
        object
            .add_relocation(
                text,
                Relocation {
                    offset: 2,
                    size: 64,
                    kind: RelocationKind::Absolute,
                    encoding: RelocationEncoding::Generic,
                    symbol: import,
                    addend: 0,
                },
            )
            .unwrap();

        let imports = [FunctionBinding {
            address: host_forty_two as usize,
        }];
        let (module, function_defs) = load_simple(object, 1, &imports).unwrap();
        let entry: extern "C" fn() -> i32 =
            unsafe { std::mem::transmute(function_defs[0].base_address()) };
        assert_eq!(entry(), 42);
        unload_module(&module);
    }

    #[test]
    fn intra_image_relative_calls_resolve_locally() {
        // functionDef0 tail-calls functionDef1 through a PC-relative
        // relocation against the locally defined symbol.
        let mut object = new_object();
        let mut caller = vec![0xe9, 0, 0, 0, 0]; // jmp rel32
        caller.resize(16, 0xcc);
        add_function(&mut object, "functionDef0", &caller);
        add_function(&mut object, "functionDef1", &return_constant_code(7, 16));

        let text = object.section_id(StandardSection::Text);
        let callee = object.symbol_id(b"functionDef1").unwrap();
        object
            .add_relocation(
                text,
                Relocation {
                    offset: 1,
                    size: 32,
                    kind: RelocationKind::Relative,
                    encoding: RelocationEncoding::Generic,
                    symbol: callee,
                    addend: -4,
                },
            )
            .unwrap();

        let (module, function_defs) = load_simple(object, 2, &[]).unwrap();
        let entry: extern "C" fn() -> i32 =
            unsafe { std::mem::transmute(function_defs[0].base_address()) };
        assert_eq!(entry(), 7);
        unload_module(&module);
    }
}
