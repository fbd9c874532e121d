// Shared fixtures: a serde_json-backed message seam, the Order demo service
// and helpers for running servers and client event loops in tests.

use std::{
    any::Any,
    future::Future,
    net::SocketAddr,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use rocket_rpc::{
    net::{event_loop::EventLoop, tcp_server::TcpServer},
    rpc::{
        channel::RpcChannel,
        controller::RpcController,
        dispatcher::RpcDispatcher,
        service::{MethodDescriptor, RpcMessage, RpcService, response_slot},
    },
};
use serde::{Deserialize, Serialize};

/// Implements `RpcMessage` over serde_json for a test message type.
macro_rules! json_message {
    ($ty:ty) => {
        impl RpcMessage for $ty {
            fn marshal(&self) -> Result<Vec<u8>> {
                serde_json::to_vec(self).map_err(Into::into)
            }

            fn unmarshal(&mut self, data: &[u8]) -> Result<()> {
                *self = serde_json::from_slice(data)?;
                Ok(())
            }

            fn as_any(&self) -> &dyn Any {
                self
            }

            fn as_any_mut(&mut self) -> &mut dyn Any {
                self
            }

            fn into_any(self: Box<Self>) -> Box<dyn Any> {
                self
            }
        }
    };
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MakeOrderRequest {
    pub price: i64,
    pub goods: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MakeOrderResponse {
    pub ret_code: i32,
    pub res_info: String,
    pub order_id: String,
}

json_message!(MakeOrderRequest);
json_message!(MakeOrderResponse);

/// The Order service: rejects orders under ten with an in-band error,
/// otherwise hands out a fixed order id. Records the msg-id it saw so
/// propagation tests can assert on it.
#[derive(Default)]
pub struct OrderImpl {
    pub seen_msg_id: Arc<Mutex<Option<String>>>,
    /// Artificial handler delay, for timeout tests.
    pub delay: Option<Duration>,
}

impl RpcService for OrderImpl {
    fn service_name(&self) -> &'static str {
        "Order"
    }

    fn method_descriptors(self: Arc<Self>) -> Vec<MethodDescriptor> {
        let service = self;
        vec![MethodDescriptor {
            full_name: "Order.makeOrder".to_string(),
            new_request: || Box::new(MakeOrderRequest::default()),
            new_response: || Box::new(MakeOrderResponse::default()),
            handler: Arc::new(move |req, rsp, controller| {
                let req = req
                    .as_any()
                    .downcast_ref::<MakeOrderRequest>()
                    .expect("request type");
                let rsp = rsp
                    .as_any_mut()
                    .downcast_mut::<MakeOrderResponse>()
                    .expect("response type");

                *service.seen_msg_id.lock().expect("seen lock") =
                    Some(controller.msg_id());
                if let Some(delay) = service.delay {
                    thread::sleep(delay);
                }

                if req.price < 10 {
                    rsp.ret_code = -1;
                    rsp.res_info = "short balance".to_string();
                    return;
                }
                rsp.order_id = "20230514".to_string();
            }),
        }]
    }
}

/// A service whose handler always panics; exercises the dispatcher's panic
/// containment.
pub struct PanicImpl;

impl RpcService for PanicImpl {
    fn service_name(&self) -> &'static str {
        "Panic"
    }

    fn method_descriptors(self: Arc<Self>) -> Vec<MethodDescriptor> {
        vec![MethodDescriptor {
            full_name: "Panic.boom".to_string(),
            new_request: || Box::new(MakeOrderRequest::default()),
            new_response: || Box::new(MakeOrderResponse::default()),
            handler: Arc::new(|_, _, _| panic!("deliberate test panic")),
        }]
    }
}

/// Relays every request to an Order server without setting a msg-id, so the
/// ambient one must flow through.
pub struct RelayImpl {
    pub order_addr: SocketAddr,
}

impl RpcService for RelayImpl {
    fn service_name(&self) -> &'static str {
        "Relay"
    }

    fn method_descriptors(self: Arc<Self>) -> Vec<MethodDescriptor> {
        let service = self;
        vec![MethodDescriptor {
            full_name: "Relay.forward".to_string(),
            new_request: || Box::new(MakeOrderRequest::default()),
            new_response: || Box::new(MakeOrderResponse::default()),
            handler: Arc::new(move |req, rsp, _controller| {
                let req = req
                    .as_any()
                    .downcast_ref::<MakeOrderRequest>()
                    .expect("request type");
                let rsp = rsp
                    .as_any_mut()
                    .downcast_mut::<MakeOrderResponse>()
                    .expect("response type");

                // Fire the downstream call; its msg-id must be inherited
                // from the ambient context, not set here.
                let channel = RpcChannel::new(vec![service.order_addr]);
                let controller = Arc::new(RpcController::new());
                let response = response_slot::<MakeOrderResponse>();
                channel.call_method(
                    "Order.makeOrder",
                    controller,
                    req,
                    response,
                    None,
                );

                rsp.res_info = "relayed".to_string();
            }),
        }]
    }
}

/// A server running on its own thread, stopped and joined on `shutdown`.
pub struct TestServer {
    server: Arc<TcpServer>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TestServer {
    pub fn start(dispatcher: Arc<RpcDispatcher>, io_threads: usize) -> Result<Self> {
        let addr: SocketAddr = "127.0.0.1:0".parse()?;
        let server = TcpServer::new(addr, io_threads, dispatcher)?;
        let runner = server.clone();
        let thread = thread::Builder::new()
            .name("test-server".to_string())
            .spawn(move || runner.start())?;
        Ok(Self {
            server,
            thread: Some(thread),
        })
    }

    pub fn start_order(order: Arc<OrderImpl>) -> Result<Self> {
        let dispatcher = RpcDispatcher::new();
        dispatcher.register_service(order);
        Self::start(dispatcher, 2)
    }

    pub fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn server(&self) -> &Arc<TcpServer> {
        &self.server
    }

    pub fn shutdown(mut self) {
        self.server.stop();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Drives `fut` on the calling thread's event loop, the way a client main
/// does, and hands its output back once the loop drains.
pub fn run_on_client_loop<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let event_loop = EventLoop::for_current_thread()?;
    let (tx, rx) = std::sync::mpsc::channel();
    event_loop.spawn(async move {
        let _ = tx.send(fut.await);
    });
    event_loop.run();
    rx.recv().context("client task dropped its result")
}
