// Kernels can be exported as ELF relocatable objects for inspection with objdump or a
// debugger. The object holds one .text section with the machine code and a single global
// function symbol spanning it. Emitted code embeds absolute addresses of kernel executors and
// helper entry points of the process that produced it, so the object is meant for reading,
// not for linking into another process.

//! ELF export of compiled kernels.

use object::write::{Object, StandardSection, Symbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SymbolFlags, SymbolKind, SymbolScope};

use crate::core::{Result, SnippetsError};
use crate::target_machine::CompiledSnippet;

/// Serialize `snippet` as an x86-64 ELF object exposing it under `symbol`.
pub fn write_elf(snippet: &dyn CompiledSnippet, symbol: &str) -> Result<Vec<u8>> {
    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    let offset = obj.append_section_data(text, snippet.bytes(), 16);
    obj.add_symbol(Symbol {
        name: symbol.as_bytes().to_vec(),
        value: offset,
        size: snippet.get_code_size() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    obj.write().map_err(|e| SnippetsError::Encoding { reason: format!("elf export: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::jit::JitSnippet;
    use object::{Object as _, ObjectSection, ObjectSymbol};

    #[test]
    fn test_symbol_covers_code() {
        let snippet = JitSnippet::new(vec![0x90, 0x90, 0xC3]).unwrap();
        let bytes = write_elf(&snippet, "snippet_kernel").unwrap();
        let file = object::File::parse(&*bytes).unwrap();
        assert_eq!(file.architecture(), Architecture::X86_64);
        let sym = file.symbol_by_name("snippet_kernel").unwrap();
        assert_eq!(sym.size(), 3);
        assert!(sym.is_definition());
        let text = file.section_by_name(".text").unwrap();
        assert_eq!(text.data().unwrap(), &[0x90, 0x90, 0xC3]);
    }
}
