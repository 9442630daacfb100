use std::env;
use std::fs;
use std::path::Path;
use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use serde::Deserialize;

const DICTIONARY: &str = "ocpp_dictionaries/ocpp16j.json";

#[derive(Debug, Deserialize)]
struct OcppDictionary {
    version: String,
    subprotocol: String,
    actions: Vec<ActionDef>,
}

#[derive(Debug, Deserialize)]
struct ActionDef {
    name: String,
    initiator: InitiatorDef,
    #[serde(default)]
    bootstrap: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
enum InitiatorDef {
    ChargePoint,
    CentralSystem,
    Both,
}

fn generate_action_catalogue(dict: &OcppDictionary) -> TokenStream {
    let version = &dict.version;
    let subprotocol = &dict.subprotocol;

    let variants: Vec<_> = dict.actions.iter().map(|a| format_ident!("{}", a.name)).collect();
    let names: Vec<_> = dict.actions.iter().map(|a| a.name.as_str()).collect();
    let initiators: Vec<_> = dict
        .actions
        .iter()
        .map(|a| match a.initiator {
            InitiatorDef::ChargePoint => quote! { Initiator::ChargePoint },
            InitiatorDef::CentralSystem => quote! { Initiator::CentralSystem },
            InitiatorDef::Both => quote! { Initiator::Both },
        })
        .collect();
    let bootstrap: Vec<_> = dict
        .actions
        .iter()
        .filter(|a| a.bootstrap)
        .map(|a| format_ident!("{}", a.name))
        .collect();

    quote! {
        /// Protocol version the catalogue was generated from.
        pub const PROTOCOL_VERSION: &str = #version;

        /// WebSocket subprotocol token announced by charge points speaking this version.
        pub const DEFAULT_SUBPROTOCOL: &str = #subprotocol;

        /// Every action defined by the protocol dictionary.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Action {
            #( #variants, )*
        }

        impl Action {
            pub const ALL: &'static [Action] = &[ #( Action::#variants, )* ];

            pub fn as_str(&self) -> &'static str {
                match self {
                    #( Action::#variants => #names, )*
                }
            }

            pub fn from_name(name: &str) -> Option<Action> {
                match name {
                    #( #names => Some(Action::#variants), )*
                    _ => None,
                }
            }

            pub fn initiator(&self) -> Initiator {
                match self {
                    #( Action::#variants => #initiators, )*
                }
            }

            /// True for the action that completes the boot handshake.
            pub fn is_bootstrap(&self) -> bool {
                matches!(self, #( Action::#bootstrap )|* )
            }
        }

        impl std::fmt::Display for Action {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    }
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed={}", DICTIONARY);

    let raw = fs::read_to_string(DICTIONARY).expect("read OCPP dictionary");
    let dict: OcppDictionary = serde_json::from_str(&raw).expect("parse OCPP dictionary");
    if !dict.actions.iter().any(|a| a.bootstrap) {
        panic!("{} must mark one action as bootstrap", DICTIONARY);
    }

    let generated = generate_action_catalogue(&dict);
    // Fail the build here rather than at include! time with a confusing span.
    syn::parse2::<syn::File>(generated.clone()).expect("generated catalogue is not valid Rust");

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set");
    let dest_path = Path::new(&out_dir).join("actions.rs");
    let header = "// AUTO-GENERATED by build.rs. Do not edit by hand.\n";
    fs::write(&dest_path, format!("{}{}", header, generated)).expect("write generated catalogue");
}
